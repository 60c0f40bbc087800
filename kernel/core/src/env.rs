use crate::limine_requests::KERNEL_FILE_REQUEST;
use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use spin::Once;

static ENVIRONMENT: Once<BTreeMap<String, String>> = Once::new();

/// Raw kernel command line from the bootloader.
pub fn cmdline() -> &'static [u8] {
    KERNEL_FILE_REQUEST
        .get_response()
        .map(|r| r.file().cmdline())
        .unwrap_or(&[])
}

/// Parse the command line into `key=value` pairs. Read once at init;
/// everything after goes through [`get`].
pub fn init() {
    ENVIRONMENT.call_once(|| {
        let mut map = BTreeMap::new();
        if let Ok(s) = core::str::from_utf8(cmdline()) {
            for token in s.split_whitespace() {
                if let Some((key, value)) = token.split_once('=') {
                    map.insert(key.to_string(), value.to_string());
                }
            }
        }
        map
    });
}

pub fn get(key: &str) -> Option<&'static str> {
    ENVIRONMENT.get()?.get(key).map(|s| s.as_str())
}
