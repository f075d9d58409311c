use std::collections::{BTreeMap, VecDeque};
use std::io::BufRead;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use homestak_core::cancel::CancelToken;
use homestak_core::error::ErrorKind;

use crate::report::parse_trailer;
use crate::shell::{shell_quote, SSH_OPTS};

/// Cap on the in-memory capture; overflow drops the oldest lines but
/// never the live stream.
const CAPTURE_LIMIT_BYTES: usize = 256 * 1024;

/// After the soft timeout the remote side gets this long to exit
/// before the channel is forcibly closed.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// How a delegated command reaches its target.
pub enum Transport {
    /// Interactive SSH channel with a pseudo-terminal, so colorized
    /// progress and prompts render sensibly.
    Ssh { host: String, user: String },
    /// Local subprocess through the shell; used by tests and loopback
    /// delegation.
    Local,
}

pub struct StreamRequest {
    pub transport: Transport,
    pub command: String,
    /// Environment propagated to the remote command.
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
    pub cancel: CancelToken,
    /// Label prefixed onto streamed lines in the operator's view.
    pub label: String,
}

#[derive(Debug)]
pub struct StreamOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub duration_seconds: f64,
    /// Context map from the structured-result trailer, if present.
    pub context: BTreeMap<String, String>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

enum Line {
    Out(String),
    Err(String),
    Eof,
}

/// Execute a command on the target, streaming output live and
/// extracting the structured-result trailer at exit.
pub fn run_streaming(request: &StreamRequest) -> StreamOutcome {
    let started = Instant::now();

    let mut child = match spawn(request) {
        Ok(child) => child,
        Err(e) => {
            return StreamOutcome {
                success: false,
                exit_code: None,
                duration_seconds: started.elapsed().as_secs_f64(),
                context: BTreeMap::new(),
                error: Some(e.to_string()),
                error_kind: Some(ErrorKind::Internal),
            }
        }
    };
    let pid = child.id() as i32;

    let (tx, rx) = mpsc::channel::<Line>();

    // The PTY terminates lines with \r\n; strip the carriage return
    // so trailer parsing sees clean JSON.
    fn clean(mut line: String) -> String {
        while line.ends_with('\r') {
            line.pop();
        }
        line
    }

    let stdout = child.stdout.take().expect("stdout is piped");
    let out_tx = tx.clone();
    let out_reader = std::thread::spawn(move || {
        let reader = std::io::BufReader::new(stdout);
        for line in reader.lines().map_while(Result::ok) {
            if out_tx.send(Line::Out(clean(line))).is_err() {
                return;
            }
        }
        let _ = out_tx.send(Line::Eof);
    });

    let stderr = child.stderr.take().expect("stderr is piped");
    let err_tx = tx;
    let err_reader = std::thread::spawn(move || {
        let reader = std::io::BufReader::new(stderr);
        for line in reader.lines().map_while(Result::ok) {
            if err_tx.send(Line::Err(clean(line))).is_err() {
                return;
            }
        }
    });

    let mut capture: VecDeque<String> = VecDeque::new();
    let mut capture_bytes = 0usize;
    let mut stderr_tail: VecDeque<String> = VecDeque::new();
    let deadline = started + request.timeout;
    let mut timed_out = false;
    let mut cancelled = false;
    let mut term_sent_at: Option<Instant> = None;

    loop {
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(Line::Out(line)) => {
                stream_line(&request.label, &line);
                capture_bytes += line.len();
                capture.push_back(line);
                while capture_bytes > CAPTURE_LIMIT_BYTES {
                    if let Some(dropped) = capture.pop_front() {
                        capture_bytes -= dropped.len();
                    } else {
                        break;
                    }
                }
            }
            Ok(Line::Err(line)) => {
                if !line.trim().is_empty() {
                    info!("[{}] {}", request.label, line);
                    if stderr_tail.len() >= 10 {
                        stderr_tail.pop_front();
                    }
                    stderr_tail.push_back(line);
                }
            }
            Ok(Line::Eof) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }

        if request.cancel.is_cancelled() && !cancelled {
            cancelled = true;
            warn!("[{}] Cancelled; signalling remote side", request.label);
            terminate(pid);
            term_sent_at = Some(Instant::now());
        }
        if Instant::now() > deadline && !timed_out && !cancelled {
            timed_out = true;
            warn!(
                timeout_secs = request.timeout.as_secs(),
                "[{}] Soft timeout expired; signalling remote side", request.label
            );
            terminate(pid);
            term_sent_at = Some(Instant::now());
        }
        if let Some(sent) = term_sent_at {
            if Instant::now() > sent + KILL_GRACE {
                let _ = child.kill();
                break;
            }
        }
    }

    let status = child.wait().ok();
    let _ = out_reader.join();
    let _ = err_reader.join();

    let exit_code = status.and_then(|s| s.code());
    let duration = started.elapsed().as_secs_f64();
    let output = capture.make_contiguous().join("\n");

    if cancelled {
        return StreamOutcome {
            success: false,
            exit_code,
            duration_seconds: duration,
            context: BTreeMap::new(),
            error: Some("delegated run cancelled".to_string()),
            error_kind: Some(ErrorKind::Cancelled),
        };
    }
    if timed_out {
        return StreamOutcome {
            success: false,
            exit_code,
            duration_seconds: duration,
            context: BTreeMap::new(),
            error: Some(format!(
                "delegated run exceeded {}s",
                request.timeout.as_secs()
            )),
            error_kind: Some(ErrorKind::Timeout),
        };
    }

    match parse_trailer(&output) {
        Some(trailer) => {
            let success = trailer
                .get("success")
                .and_then(|v| v.as_bool())
                .unwrap_or(exit_code == Some(0));
            let context = trailer
                .get("context")
                .and_then(|v| v.as_object())
                .map(|map| {
                    map.iter()
                        .filter_map(|(k, v)| {
                            v.as_str().map(|s| (k.clone(), s.to_string()))
                        })
                        .collect()
                })
                .unwrap_or_default();
            let error = trailer
                .get("error")
                .and_then(|v| v.as_str())
                .map(String::from);
            StreamOutcome {
                success,
                exit_code,
                duration_seconds: duration,
                context,
                error: if success { None } else { error.or_else(|| last_stderr(&stderr_tail)) },
                error_kind: if success { None } else { Some(ErrorKind::RemoteFailure) },
            }
        }
        None => {
            // No trailer: the exit code is all we have.
            let success = exit_code == Some(0);
            StreamOutcome {
                success,
                exit_code,
                duration_seconds: duration,
                context: BTreeMap::new(),
                error: if success {
                    None
                } else {
                    last_stderr(&stderr_tail)
                        .or_else(|| Some(format!("exit code {:?}", exit_code)))
                },
                error_kind: if success { None } else { Some(ErrorKind::RemoteFailure) },
            }
        }
    }
}

fn spawn(request: &StreamRequest) -> anyhow::Result<std::process::Child> {
    let mut env_prefix = String::new();
    for (key, value) in &request.env {
        env_prefix.push_str(&format!("{}={} ", key, shell_quote(value)));
    }
    let full_command = format!("{}{}", env_prefix, request.command);

    let mut cmd = match &request.transport {
        Transport::Ssh { host, user } => {
            let mut cmd = Command::new("ssh");
            cmd.args(SSH_OPTS)
                // A PTY keeps interactive progress output flowing.
                .arg("-t")
                .args(["-o", "ConnectTimeout=30"])
                .arg(format!("{}@{}", user, host))
                .arg(full_command);
            cmd
        }
        Transport::Local => {
            let mut cmd = Command::new("sh");
            cmd.args(["-c", &full_command]);
            cmd
        }
    };

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    debug!(label = %request.label, "Spawning delegated command");
    Ok(cmd.spawn()?)
}

/// Structured trailers and their surroundings stay at debug; phase
/// progress streams at info.
fn stream_line(label: &str, line: &str) {
    if line.trim().is_empty() {
        return;
    }
    if line.trim_start().starts_with('{') {
        debug!("[{}] {}", label, line);
    } else {
        info!("[{}] {}", label, line);
    }
}

fn terminate(pid: i32) {
    let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
}

fn last_stderr(tail: &VecDeque<String>) -> Option<String> {
    tail.back().map(|line| line.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_request(command: &str, timeout: Duration) -> StreamRequest {
        StreamRequest {
            transport: Transport::Local,
            command: command.to_string(),
            env: Vec::new(),
            timeout,
            cancel: CancelToken::new(),
            label: "test".to_string(),
        }
    }

    #[test]
    fn test_trailer_overrides_exit_code() {
        // Exit 3 but trailer says success; the trailer wins.
        let request = local_request(
            r#"echo working; echo '{"success":true,"context":{"edge_address":"192.0.2.7"}}'; exit 3"#,
            Duration::from_secs(10),
        );
        let outcome = run_streaming(&request);
        assert!(outcome.success);
        assert_eq!(outcome.exit_code, Some(3));
        assert_eq!(
            outcome.context.get("edge_address").map(String::as_str),
            Some("192.0.2.7")
        );
    }

    #[test]
    fn test_failure_trailer_preserves_error() {
        let request = local_request(
            r#"echo '{"success":false,"error":"edge configure: not-ready: timeout"}'"#,
            Duration::from_secs(10),
        );
        let outcome = run_streaming(&request);
        assert!(!outcome.success);
        assert_eq!(outcome.error_kind, Some(ErrorKind::RemoteFailure));
        assert_eq!(
            outcome.error.as_deref(),
            Some("edge configure: not-ready: timeout")
        );
    }

    #[test]
    fn test_no_trailer_uses_exit_code() {
        let ok = run_streaming(&local_request("echo plain output", Duration::from_secs(10)));
        assert!(ok.success);
        assert!(ok.context.is_empty());

        let bad = run_streaming(&local_request(
            "echo oops >&2; exit 7",
            Duration::from_secs(10),
        ));
        assert!(!bad.success);
        assert_eq!(bad.exit_code, Some(7));
        assert_eq!(bad.error_kind, Some(ErrorKind::RemoteFailure));
        assert_eq!(bad.error.as_deref(), Some("oops"));
    }

    #[test]
    fn test_malformed_trailer_falls_back() {
        let request = local_request("echo '{not json'; exit 0", Duration::from_secs(10));
        let outcome = run_streaming(&request);
        assert!(outcome.success);
        assert!(outcome.context.is_empty());
    }

    #[test]
    fn test_soft_timeout_kills_remote() {
        let started = Instant::now();
        let request = local_request("sleep 30", Duration::from_millis(300));
        let outcome = run_streaming(&request);
        assert!(!outcome.success);
        assert_eq!(outcome.error_kind, Some(ErrorKind::Timeout));
        // TERM lands well before the sleep could finish.
        assert!(started.elapsed() < Duration::from_secs(15));
    }

    #[test]
    fn test_cancellation_reaches_child() {
        let cancel = CancelToken::new();
        let request = StreamRequest {
            transport: Transport::Local,
            command: "sleep 30".to_string(),
            env: Vec::new(),
            timeout: Duration::from_secs(60),
            cancel: cancel.clone(),
            label: "test".to_string(),
        };
        cancel.cancel();
        let outcome = run_streaming(&request);
        assert!(!outcome.success);
        assert_eq!(outcome.error_kind, Some(ErrorKind::Cancelled));
    }

    #[test]
    fn test_env_propagates_to_remote() {
        let request = StreamRequest {
            transport: Transport::Local,
            command: "echo \"url=$REPO_SERVER_URL\"".to_string(),
            env: vec![(
                "REPO_SERVER_URL".to_string(),
                "https://192.0.2.1:44443".to_string(),
            )],
            timeout: Duration::from_secs(10),
            cancel: CancelToken::new(),
            label: "test".to_string(),
        };
        let outcome = run_streaming(&request);
        assert!(outcome.success);
    }

    #[test]
    fn test_capture_bounded_but_trailer_survives() {
        // Generate output past the capture cap, then the trailer.
        let request = local_request(
            &format!(
                "i=0; while [ $i -lt 6000 ]; do echo 'xxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx line'; i=$((i+1)); done; echo '{}'",
                r#"{"success":true,"context":{"k":"v"}}"#
            ),
            Duration::from_secs(30),
        );
        let outcome = run_streaming(&request);
        assert!(outcome.success);
        assert_eq!(outcome.context.get("k").map(String::as_str), Some("v"));
    }
}
