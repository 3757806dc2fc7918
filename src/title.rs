//! Process title updates for forked workers.
//!
//! The title shows how long the worker has been up. Refresh cadence follows
//! the displayed unit: every second under a minute, every minute under an
//! hour, hourly after that.
//!
//! On Linux the title replaces the process's argument area, which is what
//! `ps` and `/proc/<pid>/cmdline` show. The area keeps its original size, so
//! long titles are cut.

use std::thread;
use std::time::{Duration, Instant};

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * 60;

/// Render an uptime the way the title shows it ("1 sec", "5 mins", "2 hours").
pub fn distance_in_words(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    if secs < MINUTE {
        pluralize(secs, "sec")
    } else if secs < HOUR {
        pluralize(secs / MINUTE, "min")
    } else {
        pluralize(secs / HOUR, "hour")
    }
}

fn pluralize(amount: u64, unit: &str) -> String {
    if amount == 1 {
        format!("{} {}", amount, unit)
    } else {
        format!("{} {}s", amount, unit)
    }
}

/// How long to wait before the rendered distance can change.
pub fn next_wait(elapsed: Duration) -> Duration {
    let secs = elapsed.as_secs();
    if secs < MINUTE {
        Duration::from_secs(1)
    } else if secs < HOUR {
        Duration::from_secs(MINUTE)
    } else {
        Duration::from_secs(HOUR)
    }
}

/// Bounds of the argument strings in process memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgArea {
    start: usize,
    len: usize,
}

/// Extract `arg_start`/`arg_end` (fields 48 and 49) from `/proc/<pid>/stat`.
pub fn parse_arg_area(stat: &str) -> Option<ArgArea> {
    // The command name in field 2 may contain spaces; count from its `)`.
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let start: usize = fields.get(45)?.parse().ok()?;
    let end: usize = fields.get(46)?.parse().ok()?;
    (start > 0 && end > start).then_some(ArgArea { start, len: end - start })
}

/// Handle on this process's title.
#[derive(Debug, Clone, Copy)]
pub struct ProcessTitle {
    area: Option<ArgArea>,
}

impl ProcessTitle {
    /// Find the argument area. A forked child shares the parent's layout, so
    /// this can run before forking.
    pub fn locate() -> Self {
        let area = std::fs::read_to_string("/proc/self/stat")
            .ok()
            .and_then(|stat| parse_arg_area(&stat));
        Self { area }
    }

    /// Replace the title. Other threads must not read the process arguments
    /// meanwhile.
    pub fn set(&self, title: &str) {
        let Some(area) = self.area else {
            tracing::debug!("process title: {}", title);
            return;
        };

        // Keep the final NUL so the kernel reports the area as plain argv.
        let mut buf = vec![0u8; area.len];
        let n = title.len().min(area.len - 1);
        buf[..n].copy_from_slice(&title.as_bytes()[..n]);
        // SAFETY: [start, start + len) is the argument block the kernel mapped
        // for this process; it stays writable for the process's lifetime.
        unsafe { std::ptr::copy_nonoverlapping(buf.as_ptr(), area.start as *mut u8, area.len) };
    }
}

pub struct ProcessTitleUpdater;

impl ProcessTitleUpdater {
    /// Spawn the updater thread. `render` receives the uptime in words.
    pub fn spawn<F>(title: ProcessTitle, render: F) -> std::io::Result<thread::JoinHandle<()>>
    where
        F: Fn(&str) -> String + Send + 'static,
    {
        let started = Instant::now();
        thread::Builder::new()
            .name("title-updater".into())
            .spawn(move || loop {
                let elapsed = started.elapsed();
                title.set(&render(&distance_in_words(elapsed)));
                thread::sleep(next_wait(elapsed));
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_in_words() {
        assert_eq!(distance_in_words(Duration::from_secs(0)), "0 secs");
        assert_eq!(distance_in_words(Duration::from_secs(1)), "1 sec");
        assert_eq!(distance_in_words(Duration::from_secs(59)), "59 secs");
        assert_eq!(distance_in_words(Duration::from_secs(60)), "1 min");
        assert_eq!(distance_in_words(Duration::from_secs(150)), "2 mins");
        assert_eq!(distance_in_words(Duration::from_secs(3600)), "1 hour");
        assert_eq!(distance_in_words(Duration::from_secs(3 * 3600 + 59)), "3 hours");
    }

    #[test]
    fn test_next_wait_follows_unit() {
        assert_eq!(next_wait(Duration::from_secs(10)), Duration::from_secs(1));
        assert_eq!(next_wait(Duration::from_secs(600)), Duration::from_secs(60));
        assert_eq!(next_wait(Duration::from_secs(7200)), Duration::from_secs(3600));
    }

    #[test]
    fn test_parse_arg_area() {
        // 52 fields; the name contains a space and a parenthesis.
        let mut fields: Vec<String> = (3..=52).map(|n| n.to_string()).collect();
        fields[45] = "140000".into();
        fields[46] = "140064".into();
        let stat = format!("4242 (my (odd) name) {}", fields.join(" "));

        assert_eq!(parse_arg_area(&stat), Some(ArgArea { start: 140000, len: 64 }));
        assert_eq!(parse_arg_area("4242 (short) S 1 2"), None);
        assert_eq!(parse_arg_area("garbage"), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_locate_finds_own_arguments() {
        let title = ProcessTitle::locate();
        let area = title.area.expect("argument area");
        let cmdline = std::fs::read("/proc/self/cmdline").unwrap();
        assert_eq!(area.len, cmdline.len());
    }
}
