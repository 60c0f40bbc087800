pub mod context;
pub mod frame;
pub mod kcontext;
pub mod runloop;
pub mod switch;
pub mod thread;
