/*!
Scripted filesystem figures

Stands in for statvfs(2): returns whatever figures the test set, and can be
told to fail the next few calls.
*/

use std::io;
use std::path::Path;

use minnow_agent::stats::RawFsStat;
use minnow_agent::StatSource;
use parking_lot::Mutex;

struct Script {
    current: RawFsStat,
    failures: u32,
    calls: u64,
}

pub struct ScriptedStats {
    script: Mutex<Script>,
}

impl ScriptedStats {
    pub fn new(current: RawFsStat) -> Self {
        Self {
            script: Mutex::new(Script {
                current,
                failures: 0,
                calls: 0,
            }),
        }
    }

    /// 1 GiB filesystem, half full, 4 KiB fragments.
    pub fn half_full() -> Self {
        Self::new(RawFsStat {
            blocks_available: 131_072,
            blocks: 262_144,
            fragment_size: 4096,
        })
    }

    pub fn set(&self, current: RawFsStat) {
        self.script.lock().current = current;
    }

    /// Fail the next `count` calls with an I/O error.
    pub fn fail_next(&self, count: u32) {
        self.script.lock().failures = count;
    }

    pub fn calls(&self) -> u64 {
        self.script.lock().calls
    }
}

impl StatSource for ScriptedStats {
    fn stat(&self, _path: &Path) -> io::Result<RawFsStat> {
        let mut script = self.script.lock();
        script.calls += 1;
        if script.failures > 0 {
            script.failures -= 1;
            return Err(io::Error::new(io::ErrorKind::Other, "scripted statvfs failure"));
        }
        Ok(script.current)
    }
}
