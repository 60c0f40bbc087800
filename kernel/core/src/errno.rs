/// Raw kernel-internal return value: a byte/handle count, or a negated
/// [`Errno`]. This is the representation that travels through blockq
/// actions and completions; public APIs convert to `Result` at the edge.
pub type Sysreturn = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum Errno {
    Badf = 9,
    Again = 11,
    NoMem = 12,
    Fault = 14,
    Busy = 16,
    Inval = 22,
    Mfile = 24,
    Pipe = 32,
    OpNotSupp = 95,
    TimedOut = 110,
    /// Interrupted by a blockq flush; the operation may be restarted.
    RestartSys = 512,
}

impl Errno {
    pub const fn as_sysreturn(self) -> Sysreturn {
        -(self as i64)
    }
}

impl From<Errno> for Sysreturn {
    fn from(e: Errno) -> Sysreturn {
        e.as_sysreturn()
    }
}

/// Collapse a `Result` into the raw representation.
pub fn sysreturn_from(r: Result<usize, Errno>) -> Sysreturn {
    match r {
        Ok(n) => n as Sysreturn,
        Err(e) => e.as_sysreturn(),
    }
}

/// Split a raw return back out. Values that do not match a known errno are
/// reported as `Inval`; the core only ever produces the variants above.
pub fn result_from(rv: Sysreturn) -> Result<usize, Errno> {
    if rv >= 0 {
        return Ok(rv as usize);
    }
    Err(match -rv {
        9 => Errno::Badf,
        11 => Errno::Again,
        12 => Errno::NoMem,
        14 => Errno::Fault,
        16 => Errno::Busy,
        22 => Errno::Inval,
        24 => Errno::Mfile,
        32 => Errno::Pipe,
        95 => Errno::OpNotSupp,
        110 => Errno::TimedOut,
        512 => Errno::RestartSys,
        _ => Errno::Inval,
    })
}
