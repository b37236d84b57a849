use anyhow::{anyhow, Result};
use log::{debug, info};
use std::{
    fs,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    thread,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

fn tmp_capture_path(cmd: &str) -> PathBuf {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_nanos();
    let safe = cmd.replace('/', "_");
    std::env::temp_dir().join(format!("tpctl_{safe}_{}_{ts}.out", std::process::id()))
}

fn drain(path: Option<&Path>) -> String {
    let Some(p) = path else {
        return String::new();
    };
    let s = fs::read(p)
        .map(|buf| String::from_utf8_lossy(&buf).into_owned())
        .unwrap_or_default();
    let _ = fs::remove_file(p);
    s
}

/// Run a command, killing it once `timeout` elapses.
///
/// With `capture` set, stdout and stderr are merged into a temp file rather
/// than a pipe, so a chatty child can never block on a full pipe buffer.
pub fn run_timeout(cmd: &str, args: &[&str], capture: bool, timeout: Duration) -> Result<(i32, String)> {
    debug!("exec(timeout={:?}): {} {}", timeout, cmd, args.join(" "));

    let mut c = Command::new(cmd);
    c.args(args).stdin(Stdio::null());

    let out_path = if capture {
        let p = tmp_capture_path(cmd);
        let f = fs::File::create(&p)
            .map_err(|e| anyhow!("failed to create capture file {p:?}: {e}"))?;
        let f2 = f
            .try_clone()
            .map_err(|e| anyhow!("failed to clone capture file {p:?}: {e}"))?;
        c.stdout(Stdio::from(f)).stderr(Stdio::from(f2));
        Some(p)
    } else {
        c.stdout(Stdio::null()).stderr(Stdio::null());
        None
    };

    let mut child = c.spawn().map_err(|e| anyhow!("failed to spawn {cmd}: {e}"))?;
    let start = Instant::now();

    loop {
        if let Some(st) = child.try_wait().map_err(|e| anyhow!("failed to wait {cmd}: {e}"))? {
            let code = st.code().unwrap_or(-1);
            let s = drain(out_path.as_deref());
            debug!("exit={code} output_len={}", s.len());
            return Ok((code, s));
        }

        if start.elapsed() >= timeout {
            let _ = child.kill();
            let _ = child.wait();
            let s = drain(out_path.as_deref());
            return Err(anyhow!(
                "command timeout after {:?}: {cmd} {}\n{}",
                timeout,
                args.join(" "),
                s
            ));
        }

        thread::sleep(Duration::from_millis(20));
    }
}

/// Run a full shell line via `sh -c <line>` and require exit code 0.
///
/// The error text carries both the line and whatever the command printed, so
/// callers can inspect it (e.g. for "No chain/target/match by that name").
pub fn ok_sh_timeout(line: &str, timeout: Duration) -> Result<String> {
    info!("exec: {line}");
    let (code, out) = run_timeout("sh", &["-c", line], true, timeout)?;
    if code != 0 {
        return Err(anyhow!("command failed ({code}): {line} | out={}", out.trim_end()));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: Duration = Duration::from_secs(5);

    #[test]
    fn captures_stdout_and_stderr() {
        let out = ok_sh_timeout("echo hello; echo oops 1>&2", T).unwrap();
        assert!(out.contains("hello"));
        assert!(out.contains("oops"));
    }

    #[test]
    fn nonzero_exit_reports_line_and_output() {
        let err = ok_sh_timeout("echo 'No chain/target/match by that name' 1>&2; exit 3", T)
            .unwrap_err()
            .to_string();
        assert!(err.contains("command failed (3)"));
        assert!(err.contains("No chain"));
        assert!(err.contains("exit 3"));
    }

    #[test]
    fn timeout_kills_child() {
        let err = run_timeout("sh", &["-c", "sleep 5"], false, Duration::from_millis(100)).unwrap_err();
        assert!(err.to_string().contains("command timeout"));
    }
}
