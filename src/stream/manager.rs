//! Live stream life cycle.
//!
//! One encoder subprocess per manager. `start` resolves the display and
//! devices, spawns the encoder and hands it to a supervisor task that pumps
//! stdout into the chunk sink, keeps a tail of stderr for classification, and
//! owns the single reduced-options retry. `stop` cancels the supervisor,
//! which SIGKILLs the encoder.

use bytes::Bytes;
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::ffmpeg::{build_encoder_args, classify_failure, EncoderArgs, FailureKind};
use super::{StreamOptions, StreamResolution, StreamState, StreamStatus};
use crate::devices::{list_devices, select_video_device};
use crate::display::{DisplayInfo, DisplayResolver, Size};
use crate::error::{Error, Result};
use crate::external::ExternalCommand;

/// Encoded output chunks, in emission order.
pub type ChunkSink = mpsc::Sender<Bytes>;

const READ_CHUNK: usize = 64 * 1024;
const STDERR_TAIL_LINES: usize = 32;
const MAX_LINE_BYTES: usize = 4096;
/// How long a SIGKILLed encoder gets to be reaped.
const KILL_GRACE: Duration = Duration::from_secs(2);
/// Upper bound on `stop()`.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

struct Session {
    cancel: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

pub struct StreamManager {
    encoder: ExternalCommand,
    display: DisplayResolver,
    options: StreamOptions,
    status: Arc<watch::Sender<StreamStatus>>,
    session: Option<Session>,
}

impl StreamManager {
    pub fn new(encoder: ExternalCommand, display: DisplayResolver, options: StreamOptions) -> Self {
        let (status, _) = watch::channel(StreamStatus::idle());
        Self {
            encoder,
            display,
            options,
            status: Arc::new(status),
            session: None,
        }
    }

    pub fn encoder(&self) -> &ExternalCommand {
        &self.encoder
    }

    pub fn is_active(&self) -> bool {
        self.status.borrow().state == StreamState::Streaming
    }

    pub fn status(&self) -> StreamStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<StreamStatus> {
        self.status.subscribe()
    }

    /// A supervisor that has not yet published a terminal state.
    fn session_running(&self) -> bool {
        let terminal = matches!(
            self.status.borrow().state,
            StreamState::Stopped | StreamState::Failed
        );
        !terminal && self.session.as_ref().is_some_and(|s| !s.task.is_finished())
    }

    /// Start streaming into `sink`. Returns immediately if a session is
    /// already streaming (or retrying). Not safe against concurrent callers;
    /// serialize externally.
    pub async fn start(&mut self, sink: ChunkSink) -> Result<()> {
        if self.is_active() || self.session_running() {
            debug!("Stream already running, ignoring start");
            return Ok(());
        }

        self.session = None;
        self.status.send_replace(StreamStatus {
            state: StreamState::Starting,
            ..StreamStatus::idle()
        });

        match self.launch(sink).await {
            Ok(session) => {
                self.session = Some(session);
                Ok(())
            }
            Err(e) => {
                error!("Failed to start stream: {}", e);
                self.status.send_modify(|s| {
                    s.state = StreamState::Failed;
                    s.last_error = Some(e.clone());
                });
                Err(e)
            }
        }
    }

    async fn launch(&self, sink: ChunkSink) -> Result<Session> {
        let display = self.display.resolve().await;
        let size = self.output_size(&display);

        let devices = list_devices(&self.encoder).await?;
        let device = select_video_device(&devices, self.options.device_index)?;
        info!("Streaming from video device {}", device);

        let args = EncoderArgs {
            device_index: device.index,
            fps: self.options.fps,
            crf: self.options.crf,
            size,
            capture_cursor: self.options.capture_cursor,
        };
        let child = spawn_encoder(&self.encoder, &args)?;

        self.status.send_modify(|s| {
            s.state = StreamState::Streaming;
            s.device = Some(device);
        });

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let supervisor = Supervisor {
            encoder: self.encoder.clone(),
            args,
            sink,
            status: self.status.clone(),
            cancel: cancel_rx,
        };
        let task = tokio::spawn(supervisor.run(child));

        Ok(Session {
            cancel: Some(cancel_tx),
            task,
        })
    }

    fn output_size(&self, display: &DisplayInfo) -> Option<Size> {
        let (width, height) = match self.options.resolution {
            StreamResolution::Native => return None,
            StreamResolution::Fixed { width, height } => (width, height),
            StreamResolution::Logical => {
                let Some(primary) = display.primary.as_ref() else {
                    debug!("Primary display size unknown, streaming at native size");
                    return None;
                };
                display
                    .scaling
                    .to_logical(primary.physical.width, primary.physical.height)
            }
        };
        // x264 needs even dimensions
        Some(Size {
            width: (width & !1).max(2),
            height: (height & !1).max(2),
        })
    }

    /// Kill the encoder. Bounded even if it ignores everything. No-op when
    /// nothing is running.
    pub async fn stop(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        if session.task.is_finished() {
            return;
        }

        if let Some(cancel) = session.cancel.take() {
            let _ = cancel.send(());
        }
        if timeout(STOP_TIMEOUT, &mut session.task).await.is_err() {
            error!("Encoder supervisor did not finish in time, aborting it");
            session.task.abort();
            self.status.send_modify(|s| s.state = StreamState::Stopped);
        }
        info!("Stream stopped");
    }
}

fn spawn_encoder(encoder: &ExternalCommand, args: &EncoderArgs) -> Result<Child> {
    let argv = build_encoder_args(args);
    debug!(
        "Encoder command: {} {}",
        encoder.program().to_string_lossy(),
        argv.join(" ")
    );
    encoder
        .command()
        .args(&argv)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::StreamError(format!("failed to start encoder: {}", e)))
}

enum Outcome {
    Cancelled,
    Exited { success: bool, diagnostics: String },
}

struct Supervisor {
    encoder: ExternalCommand,
    args: EncoderArgs,
    sink: ChunkSink,
    status: Arc<watch::Sender<StreamStatus>>,
    cancel: oneshot::Receiver<()>,
}

impl Supervisor {
    async fn run(mut self, mut child: Child) {
        let mut retried = false;

        loop {
            match self.watch(&mut child).await {
                Outcome::Cancelled => {
                    self.set_state(StreamState::Stopped);
                    return;
                }
                Outcome::Exited { success: true, .. } => {
                    info!("Encoder finished");
                    self.set_state(StreamState::Stopped);
                    return;
                }
                Outcome::Exited {
                    success: false,
                    diagnostics,
                } => {
                    let kind = classify_failure(&diagnostics);
                    warn!("Encoder failed ({:?}): {}", kind, diagnostics);

                    match kind {
                        FailureKind::DeviceConfiguration if !retried => {
                            retried = true;
                            // Failed -> Starting in one update so `start` never
                            // sees a terminal state while this task still owns
                            // the session.
                            self.status.send_modify(|s| {
                                s.state = StreamState::Starting;
                                s.retries += 1;
                            });
                            self.args = self.args.reduced();
                            info!("Retrying encoder without resolution and cursor options");
                            match spawn_encoder(&self.encoder, &self.args) {
                                Ok(next) => {
                                    child = next;
                                    self.set_state(StreamState::Streaming);
                                    continue;
                                }
                                Err(e) => self.fail(e),
                            }
                        }
                        FailureKind::DeviceBusy => self.fail(Error::DeviceBusy(diagnostics)),
                        _ => self.fail(Error::StreamError(diagnostics)),
                    }
                    return;
                }
            }
        }
    }

    async fn watch(&mut self, child: &mut Child) -> Outcome {
        let pump = child
            .stdout
            .take()
            .map(|out| tokio::spawn(pump_stdout(out, self.sink.clone())));
        let tail = child.stderr.take().map(|err| tokio::spawn(stderr_tail(err)));

        let exit = tokio::select! {
            status = child.wait() => Some(status),
            _ = &mut self.cancel => None,
        };
        if exit.is_none() {
            kill(child).await;
        }

        if let Some(pump) = pump {
            let _ = timeout(DRAIN_TIMEOUT, pump).await;
        }
        let mut diagnostics = match tail {
            Some(tail) => timeout(DRAIN_TIMEOUT, tail)
                .await
                .ok()
                .and_then(|r| r.ok())
                .unwrap_or_default(),
            None => String::new(),
        };

        match exit {
            None => Outcome::Cancelled,
            Some(Ok(status)) => {
                if diagnostics.is_empty() && !status.success() {
                    diagnostics = format!("encoder exited with {}", status);
                }
                Outcome::Exited {
                    success: status.success(),
                    diagnostics,
                }
            }
            Some(Err(e)) => Outcome::Exited {
                success: false,
                diagnostics: e.to_string(),
            },
        }
    }

    fn set_state(&self, state: StreamState) {
        self.status.send_modify(|s| s.state = state);
    }

    fn fail(&self, err: Error) {
        error!("Stream failed: {}", err);
        self.status.send_modify(|s| {
            s.state = StreamState::Failed;
            s.last_error = Some(err);
        });
    }
}

async fn kill(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        warn!("Failed to signal encoder: {}", e);
    }
    if timeout(KILL_GRACE, child.wait()).await.is_err() {
        error!("Encoder still running {:?} after SIGKILL", KILL_GRACE);
    }
}

/// Forward stdout to the sink chunk by chunk. Keeps draining after the sink
/// closes so the encoder never blocks on a full pipe.
async fn pump_stdout(mut stdout: ChildStdout, sink: ChunkSink) -> u64 {
    let mut buf = vec![0u8; READ_CHUNK];
    let mut sink = Some(sink);
    let mut total = 0u64;

    loop {
        let n = match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!("Reading encoder output failed: {}", e);
                break;
            }
        };
        total += n as u64;
        if let Some(tx) = &sink {
            if tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                debug!("Chunk sink closed, discarding encoder output");
                sink = None;
            }
        }
    }

    debug!("Encoder output closed after {} bytes", total);
    total
}

/// Log every stderr line and return the last few, newline-joined. Splits on
/// `\r` too since progress lines are carriage-return terminated.
async fn stderr_tail(mut stderr: ChildStderr) -> String {
    let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut line = Vec::new();
    let mut buf = [0u8; 4096];

    let push = |line: &mut Vec<u8>, tail: &mut VecDeque<String>| {
        if line.is_empty() {
            return;
        }
        let text = String::from_utf8_lossy(line).trim_end().to_string();
        line.clear();
        if text.is_empty() {
            return;
        }
        debug!(target: "ffmpeg", "{}", text);
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(text);
    };

    loop {
        let n = match stderr.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for &b in &buf[..n] {
            if b == b'\n' || b == b'\r' {
                push(&mut line, &mut tail);
            } else if line.len() < MAX_LINE_BYTES {
                line.push(b);
            }
        }
    }
    push(&mut line, &mut tail);

    Vec::from(tail).join("\n")
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::devices::testing::{MAC_REPORT, SINGLE_CAMERA_REPORT};
    use crate::display::testing as display;
    use crate::external::testing::shell;
    use std::path::Path;

    const STREAMS: &str = "printf 'moofdata'; exec sleep 30";
    const CONFIG_FAILS: &str = "echo '[avfoundation @ 0x1] Configuration of video device failed, falling back to default.' >&2; exit 1";
    const BUSY: &str = "echo '[avfoundation @ 0x1] 1:none: Device or resource busy' >&2; exit 1";
    const CRASHES: &str = "echo 'Unknown encoder libx264' >&2; exit 1";
    const FINISHES: &str = "printf 'abc'; exit 0";

    /// Fake encoder: answers the device listing with `report`, otherwise logs
    /// its arguments to `log` and runs `behaviour`.
    fn fake_encoder(log: &Path, report: &str, behaviour: &str) -> ExternalCommand {
        shell(&format!(
            "case \"$*\" in *-list_devices*) printf '%s' '{report}' >&2; exit 1;; esac\n\
             echo \"$*\" >> '{log}'\n\
             {behaviour}",
            report = report,
            log = log.display(),
            behaviour = behaviour,
        ))
    }

    fn invocations(log: &Path) -> Vec<Vec<String>> {
        std::fs::read_to_string(log)
            .unwrap_or_default()
            .lines()
            .map(|l| l.split_whitespace().map(String::from).collect())
            .collect()
    }

    fn manager(encoder: ExternalCommand, display: DisplayResolver) -> StreamManager {
        StreamManager::new(encoder, display, StreamOptions::default())
    }

    async fn wait_until(
        rx: &mut watch::Receiver<StreamStatus>,
        done: impl FnMut(&StreamStatus) -> bool,
    ) -> StreamStatus {
        timeout(Duration::from_secs(10), rx.wait_for(done))
            .await
            .expect("status change in time")
            .expect("status sender alive")
            .clone()
    }

    #[tokio::test]
    async fn test_start_streams_and_second_start_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("calls.log");
        let mut mgr = manager(fake_encoder(&log, MAC_REPORT, STREAMS), display::broken());
        let (tx, mut rx) = mpsc::channel(16);

        mgr.start(tx.clone()).await.unwrap();
        assert!(mgr.is_active());
        let chunk = timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&chunk[..], b"moofdata");
        assert_eq!(mgr.status().device.map(|d| d.index), Some(1));

        mgr.start(tx).await.unwrap();
        assert_eq!(mgr.status().state, StreamState::Streaming);
        assert_eq!(invocations(&log).len(), 1);

        mgr.stop().await;
        assert_eq!(mgr.status().state, StreamState::Stopped);
        assert!(!mgr.is_active());
    }

    #[tokio::test]
    async fn test_configuration_failure_retries_once_reduced() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("calls.log");
        let report = display::retina_report();
        let mut mgr = manager(
            fake_encoder(&log, MAC_REPORT, CONFIG_FAILS),
            display::fixed_report(&report),
        );
        let mut status = mgr.subscribe_status();
        let (tx, _rx) = mpsc::channel(16);

        mgr.start(tx).await.unwrap();
        let last = wait_until(&mut status, |s| {
            s.state == StreamState::Failed && s.retries == 1
        })
        .await;

        match last.last_error {
            Some(Error::StreamError(text)) => {
                assert!(text.contains("Configuration of video device failed"))
            }
            other => panic!("expected StreamError, got {:?}", other),
        }

        let calls = invocations(&log);
        assert_eq!(calls.len(), 2);
        assert!(calls[0].iter().any(|a| a == "-s"));
        assert!(calls[0].iter().any(|a| a == "1440x900"));
        assert!(calls[0].iter().any(|a| a == "-capture_cursor"));
        assert!(!calls[1].iter().any(|a| a == "-s"));
        assert!(!calls[1].iter().any(|a| a == "-capture_cursor"));
        assert!(!mgr.is_active());
    }

    #[tokio::test]
    async fn test_retried_session_blocks_start_and_stops_in_time() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("calls.log");
        let marker = dir.path().join("failed-once");
        let behaviour = format!(
            "if [ -e '{marker}' ]; then printf 'moofdata'; exec sleep 30; fi\n\
             touch '{marker}'\n\
             {fail}",
            marker = marker.display(),
            fail = CONFIG_FAILS,
        );
        let report = display::retina_report();
        let mut mgr = manager(
            fake_encoder(&log, MAC_REPORT, &behaviour),
            display::fixed_report(&report),
        );
        let mut status = mgr.subscribe_status();
        let (tx, mut rx) = mpsc::channel(16);

        mgr.start(tx.clone()).await.unwrap();
        let retried = wait_until(&mut status, |s| {
            s.state == StreamState::Streaming && s.retries == 1
        })
        .await;
        assert!(retried.last_error.is_none());

        // the reduced encoder logs its invocation before writing output
        let chunk = timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&chunk[..], b"moofdata");
        assert_eq!(invocations(&log).len(), 2);

        mgr.start(tx).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(invocations(&log).len(), 2);
        assert_eq!(mgr.status().retries, 1);

        let started = std::time::Instant::now();
        mgr.stop().await;
        assert!(started.elapsed() < STOP_TIMEOUT);
        assert_eq!(mgr.status().state, StreamState::Stopped);
        assert_eq!(mgr.status().retries, 1);
        assert!(!mgr.is_active());
    }

    #[tokio::test]
    async fn test_start_is_noop_while_retry_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("calls.log");
        let mut mgr = manager(fake_encoder(&log, MAC_REPORT, STREAMS), display::broken());

        // a supervisor between the failed run and the reduced respawn
        let (cancel, cancelled) = oneshot::channel::<()>();
        mgr.session = Some(Session {
            cancel: Some(cancel),
            task: tokio::spawn(async move {
                let _ = cancelled.await;
            }),
        });
        mgr.status.send_modify(|s| {
            s.state = StreamState::Starting;
            s.retries = 1;
        });

        mgr.start(mpsc::channel(1).0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(invocations(&log).is_empty());
        assert_eq!(mgr.status().state, StreamState::Starting);

        let started = std::time::Instant::now();
        mgr.stop().await;
        assert!(started.elapsed() < STOP_TIMEOUT);
        assert!(mgr.session.is_none());
    }

    #[tokio::test]
    async fn test_busy_device_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("calls.log");
        let mut mgr = manager(fake_encoder(&log, MAC_REPORT, BUSY), display::broken());
        let mut status = mgr.subscribe_status();
        let (tx, _rx) = mpsc::channel(16);

        mgr.start(tx).await.unwrap();
        let last = wait_until(&mut status, |s| s.state == StreamState::Failed).await;
        assert!(matches!(last.last_error, Some(Error::DeviceBusy(_))));
        assert_eq!(last.retries, 0);
        assert_eq!(invocations(&log).len(), 1);
    }

    #[tokio::test]
    async fn test_other_failures_surface_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("calls.log");
        let mut mgr = manager(fake_encoder(&log, MAC_REPORT, CRASHES), display::broken());
        let mut status = mgr.subscribe_status();
        let (tx, _rx) = mpsc::channel(16);

        mgr.start(tx).await.unwrap();
        let last = wait_until(&mut status, |s| s.state == StreamState::Failed).await;
        assert_eq!(
            last.last_error,
            Some(Error::StreamError("Unknown encoder libx264".into()))
        );
    }

    #[tokio::test]
    async fn test_clean_exit_stops() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("calls.log");
        let mut mgr = manager(fake_encoder(&log, MAC_REPORT, FINISHES), display::broken());
        let mut status = mgr.subscribe_status();
        let (tx, mut rx) = mpsc::channel(16);

        mgr.start(tx).await.unwrap();
        let last = wait_until(&mut status, |s| s.state == StreamState::Stopped).await;
        assert!(last.last_error.is_none());
        assert_eq!(&rx.recv().await.unwrap()[..], b"abc");

        // a finished session does not block a new one
        mgr.start(mpsc::channel(1).0).await.unwrap();
        wait_until(&mut status, |s| s.state == StreamState::Stopped).await;
        assert_eq!(invocations(&log).len(), 2);
    }

    #[tokio::test]
    async fn test_device_requirements() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("calls.log");
        let (tx, _rx) = mpsc::channel(16);

        let mut none = manager(fake_encoder(&log, "", STREAMS), display::broken());
        assert_eq!(none.start(tx.clone()).await, Err(Error::NoCaptureDevice));
        assert_eq!(none.status().state, StreamState::Failed);
        assert_eq!(none.status().last_error, Some(Error::NoCaptureDevice));

        let mut one = manager(
            fake_encoder(&log, SINGLE_CAMERA_REPORT, STREAMS),
            display::broken(),
        );
        assert_eq!(
            one.start(tx.clone()).await,
            Err(Error::InsufficientDevices {
                found: 1,
                required: 2
            })
        );

        let mut missing = manager(ExternalCommand::new("/nonexistent/ffmpeg"), display::broken());
        assert!(matches!(
            missing.start(tx).await,
            Err(Error::DeviceListUnavailable(_))
        ));
        assert!(invocations(&log).is_empty());
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_noop() {
        let mut mgr = manager(ExternalCommand::new("ffmpeg"), display::broken());
        mgr.stop().await;
        assert_eq!(mgr.status(), StreamStatus::idle());
        assert!(!mgr.is_active());
    }

    #[test]
    fn test_output_size_policy() {
        let primary = crate::display::PrimaryDisplay {
            name: None,
            logical: Size {
                width: 1440,
                height: 900,
            },
            physical: Size {
                width: 2880,
                height: 1801,
            },
        };
        let info = DisplayInfo {
            scaling: primary.scaling(),
            primary: Some(primary),
        };

        let mut mgr = manager(ExternalCommand::new("ffmpeg"), display::broken());
        let size = mgr.output_size(&info).unwrap();
        assert_eq!((size.width % 2, size.height % 2), (0, 0));

        mgr.options.resolution = StreamResolution::Native;
        assert_eq!(mgr.output_size(&info), None);

        mgr.options.resolution = StreamResolution::Fixed {
            width: 1280,
            height: 720,
        };
        assert_eq!(
            mgr.output_size(&info),
            Some(Size {
                width: 1280,
                height: 720
            })
        );
    }
}
