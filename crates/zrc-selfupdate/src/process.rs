//! Process liveness and detached launching.

use std::io;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use sysinfo::{Pid, System};

#[cfg(windows)]
const DETACHED_PROCESS: u32 = 0x0000_0008;
#[cfg(windows)]
const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

/// Whether process `pid` is running, optionally requiring its name to start
/// with `name_prefix`.
pub fn is_process_running(pid: u32, name_prefix: Option<&str>) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    if !system.refresh_process(pid) {
        return false;
    }
    match (system.process(pid), name_prefix) {
        (Some(process), Some(prefix)) => process.name().starts_with(prefix),
        (Some(_), None) => true,
        (None, _) => false,
    }
}

/// Poll until `pid` exits or `timeout` elapses. Returns whether it exited.
pub fn wait_for_exit(pid: u32, timeout: Duration, poll_interval: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !is_process_running(pid, None) {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        std::thread::sleep(poll_interval.min(deadline - now));
    }
}

/// Start `command` so that it outlives the calling process.
///
/// The child gets null stdio and its own process group, so closing the
/// parent's console or killing its group does not take the child with it.
pub fn spawn_detached(command: &mut Command) -> io::Result<Child> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        command.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
    }

    command.spawn()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_is_running() {
        assert!(is_process_running(std::process::id(), None));
        assert!(!is_process_running(std::process::id(), Some("helper-")));
    }

    #[test]
    fn test_unknown_pid_is_not_running() {
        assert!(!is_process_running(u32::MAX, None));
    }

    #[test]
    fn test_wait_for_exit_dead_pid_returns_immediately() {
        let start = Instant::now();
        assert!(wait_for_exit(
            u32::MAX,
            Duration::from_secs(5),
            Duration::from_millis(50)
        ));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_wait_for_exit_times_out() {
        let start = Instant::now();
        assert!(!wait_for_exit(
            std::process::id(),
            Duration::from_millis(200),
            Duration::from_millis(50)
        ));
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[cfg(unix)]
    #[test]
    fn test_wait_for_exit_sees_child_exit() {
        let mut child = Command::new("sleep").arg("0.2").spawn().unwrap();
        let pid = child.id();
        let reaper = std::thread::spawn(move || child.wait());
        assert!(wait_for_exit(
            pid,
            Duration::from_secs(10),
            Duration::from_millis(50)
        ));
        reaper.join().unwrap().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_spawn_detached() {
        let mut child = spawn_detached(&mut Command::new("true")).unwrap();
        assert!(child.wait().unwrap().success());
    }
}
