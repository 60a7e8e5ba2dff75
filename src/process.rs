//! App supervisor
//!
//! An [`App`] is either a process launched inside an app directory that serves
//! HTTP on a unix socket, or a static proxy target read from a pointer file.
//! Each app owns a [`Lifecycle`] running its monitors:
//!
//! - the exit watcher, which captures output and cleans up once the process
//!   is gone,
//! - the idle monitor, which stops the app after a period without requests,
//! - the restart monitor, which stops the app when `tmp/restart.txt` changes,
//! - the boot poller, which flips the app to ready once its socket accepts.

use crate::apps::AppPool;
use crate::error::AppError;
use crate::events::Events;
use crate::lifecycle::Lifecycle;
use crate::linebuffer::LineBuffer;
use crate::watch::RestartWatcher;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// How often the boot poller tries the app's socket
const BOOT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Captured output lines buffered between the readers and the exit watcher
const OUTPUT_CHANNEL_SIZE: usize = 256;

/// How requests reach an app
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// HTTP over a unix-domain socket
    Unix,
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Unix => "httpu",
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl std::fmt::Display for Scheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppStatus {
    Booting,
    Running,
    Dead,
}

impl AppStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppStatus::Booting => "booting",
            AppStatus::Running => "running",
            AppStatus::Dead => "dead",
        }
    }
}

/// One supervised backend. Always shared as `Arc<App>`.
pub struct App {
    name: String,
    scheme: Scheme,
    host: String,
    port: u16,
    dir: PathBuf,
    public: bool,
    pid: Option<u32>,
    events: Arc<Events>,
    log: LineBuffer,
    last_log_line: Mutex<String>,
    last_used: Mutex<Instant>,
    ready: watch::Sender<bool>,
    lifecycle: Arc<Lifecycle>,
    term_sent: AtomicBool,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("name", &self.name)
            .field("scheme", &self.scheme)
            .field("address", &self.address())
            .field("pid", &self.pid)
            .field("status", &self.status())
            .finish()
    }
}

impl App {
    #[allow(clippy::too_many_arguments)]
    fn new(
        name: &str,
        scheme: Scheme,
        host: String,
        port: u16,
        dir: PathBuf,
        public: bool,
        pid: Option<u32>,
        events: Arc<Events>,
    ) -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            name: name.to_string(),
            scheme,
            host,
            port,
            dir,
            public,
            pid,
            events,
            log: LineBuffer::new(),
            last_log_line: Mutex::new(String::new()),
            last_used: Mutex::new(Instant::now()),
            ready,
            lifecycle: Arc::new(Lifecycle::new()),
            term_sent: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The socket path for unix apps, `host:port` otherwise
    pub fn address(&self) -> String {
        if self.port == 0 {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether the app has a `public/` directory to serve static files from
    pub fn is_public(&self) -> bool {
        self.public
    }

    pub fn last_used(&self) -> Instant {
        *self.last_used.lock()
    }

    pub fn status(&self) -> AppStatus {
        if self.lifecycle.is_dying() {
            AppStatus::Dead
        } else if *self.ready.borrow() {
            AppStatus::Running
        } else {
            AppStatus::Booting
        }
    }

    /// Captured output and mirrored events, oldest first
    pub fn log(&self) -> String {
        self.log.contents()
    }

    pub fn last_log_line(&self) -> String {
        self.last_log_line.lock().clone()
    }

    pub fn is_dying(&self) -> bool {
        self.lifecycle.is_dying()
    }

    /// Record an event tagged with this app's name and mirror it into the log
    pub fn event_add(&self, name: &str, fields: &[(&str, Value)]) {
        let mut tagged = Vec::with_capacity(fields.len() + 1);
        tagged.push(("app", json!(self.name)));
        tagged.extend(fields.iter().cloned());

        let line = self.events.add(name, &tagged);
        self.log.append(format!("#event {}", line));
    }

    /// Stop the app. The first call records `reason` (unless the app already
    /// has a cause), emits `killing_app` and sends SIGTERM; later calls do
    /// nothing. Cleanup happens in the exit watcher.
    pub fn kill(&self, reason: &str) {
        self.lifecycle.kill(AppError::Killed {
            reason: reason.to_string(),
        });

        if self.term_sent.swap(true, Ordering::SeqCst) {
            return;
        }

        self.event_add("killing_app", &[("pid", json!(self.pid)), ("reason", json!(reason))]);

        let Some(pid) = self.pid else {
            return;
        };

        info!(app = %self.name, pid, reason, "Killing app");
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            self.event_add(
                "killing_error",
                &[("pid", json!(pid)), ("error", json!(err.to_string()))],
            );
            warn!(app = %self.name, pid, error = %err, "Error trying to kill app");
        }
    }

    /// Wait until the app accepts requests. Fails with the termination cause
    /// as soon as the app starts dying.
    pub async fn wait_until_ready(&self) -> Result<(), AppError> {
        let mut ready = self.ready.subscribe();
        tokio::select! {
            _ = ready.wait_for(|r| *r) => {}
            _ = self.lifecycle.dying() => return Err(self.lifecycle.err()),
        }

        // ready and dying can both be true by now
        if self.lifecycle.is_dying() {
            return Err(self.lifecycle.err());
        }

        *self.last_used.lock() = Instant::now();
        Ok(())
    }

    /// Wait until every monitor of the app has returned
    pub async fn wait(&self) {
        self.lifecycle.wait().await
    }

    fn mark_ready(&self) {
        self.ready.send_replace(true);
    }

    fn record_output(&self, line: &str) {
        info!(target: "devgate::app", app = %self.name, pid = ?self.pid, "{}", line);
        self.log.append(format!("{}\n", line));
        *self.last_log_line.lock() = line.to_string();
    }

    /// Launch the app living in `dir` and start its monitors
    pub async fn launch(pool: &Arc<AppPool>, name: &str, dir: &Path) -> Result<Arc<App>, AppError> {
        let tmp = dir.join("tmp");
        tokio::fs::create_dir_all(&tmp)
            .await
            .map_err(|e| AppError::io(format!("creating {}", tmp.display()), e))?;

        let socket = tmp.join(format!("devgate-{}.sock", std::process::id()));
        // A socket left by a crashed run would block the bind
        let _ = tokio::fs::remove_file(&socket).await;

        let launch = pool.launch_config();
        let shell = launch.resolve_shell();
        let start = match launch.command {
            Some(ref command) => format!("exec {}", command),
            None => default_command(name),
        };
        let script = launch_script(dir, &start);

        let mut cmd = Command::new(&shell);
        cmd.args(&launch.shell_args)
            .arg(&script)
            .current_dir(dir)
            .env("THREADS", launch.threads.to_string())
            .env("WORKERS", launch.workers.to_string())
            .env("CONFIG", "-")
            .env("SOCKET", &socket)
            .env("APP_NAME", name)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| AppError::io(format!("starting {}", shell), e))?;
        let pid = child.id();

        info!(app = name, ?pid, dir = %dir.display(), "Booting app");

        let app = Arc::new(App::new(
            name,
            Scheme::Unix,
            socket.to_string_lossy().into_owned(),
            0,
            dir.to_path_buf(),
            dir.join("public").is_dir(),
            pid,
            pool.events(),
        ));
        app.event_add("booting_app", &[("socket", json!(app.host))]);

        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_SIZE);
        if let Some(stdout) = child.stdout.take() {
            app.lifecycle.spawn(read_output(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            app.lifecycle.spawn(read_output(stderr, tx));
        }

        app.lifecycle
            .spawn(supervise(Arc::clone(&app), Arc::clone(pool), child, rx));
        app.lifecycle
            .spawn(idle_monitor(Arc::clone(&app), Arc::clone(pool)));
        app.lifecycle.spawn(restart_monitor(Arc::clone(&app)));
        app.lifecycle
            .spawn(boot_poller(Arc::clone(&app), socket, pool.boot_timeout()));

        Ok(app)
    }

    /// Create a static proxy app from the pointer file at `path`
    pub async fn proxy(pool: &Arc<AppPool>, name: &str, path: &Path) -> Result<Arc<App>, AppError> {
        let data = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| AppError::io(format!("reading {}", path.display()), e))?;
        let (scheme, host, port) = parse_pointer(&data)?;

        // Pointer files have no public directory of their own
        let dir = path.parent().unwrap_or(path).to_path_buf();
        let app = Arc::new(App::new(
            name,
            scheme,
            host,
            port,
            dir,
            false,
            None,
            pool.events(),
        ));

        let destination = format!("{}://{}", app.scheme, app.address());
        app.event_add("proxy_created", &[("destination", json!(destination))]);
        info!(app = name, %destination, "Generated proxy connection");

        app.mark_ready();

        let watcher = Arc::clone(&app);
        let pool = Arc::clone(pool);
        app.lifecycle.spawn(async move {
            watcher.lifecycle.dying().await;
            pool.remove(&watcher);
            watcher.event_add("shutdown", &[]);
            Ok(())
        });

        Ok(app)
    }
}

/// Parse the contents of a proxy pointer file: a bare port on 127.0.0.1 or
/// an `http`/`https` URL.
pub fn parse_pointer(data: &str) -> Result<(Scheme, String, u16), AppError> {
    let data = data.trim();
    let invalid = |message: &str| AppError::InvalidProxy {
        target: data.to_string(),
        message: message.to_string(),
    };

    if let Ok(port) = data.parse::<u16>() {
        return Ok((Scheme::Http, "127.0.0.1".to_string(), port));
    }

    let uri: hyper::Uri = data.parse().map_err(|e| invalid(&format!("{}", e)))?;
    let scheme = match uri.scheme_str() {
        None | Some("http") => Scheme::Http,
        Some("https") => Scheme::Https,
        Some(other) => return Err(invalid(&format!("unsupported scheme {}", other))),
    };
    let host = uri
        .host()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| invalid("missing host"))?;
    let port = uri.port_u16().unwrap_or(match scheme {
        Scheme::Https => 443,
        _ => 80,
    });

    Ok((scheme, host.to_string(), port))
}

/// Puma started the way a plain Rack app expects it
fn default_command(name: &str) -> String {
    let puma = format!(
        "puma -C $CONFIG --tag devgate:{} -w $WORKERS -t 0:$THREADS -b unix:$SOCKET",
        name
    );
    format!(
        "if test -e Gemfile && bundle exec puma -V >/dev/null 2>&1; then\n  exec bundle exec {puma}\nfi\nexec {puma}",
        puma = puma
    )
}

/// Shell script run for every launched app: enter the directory, source the
/// developer's env files, then run `start`, which must exec the server.
pub fn launch_script(dir: &Path, start: &str) -> String {
    let dir = dir.to_string_lossy();
    let mut script = format!("cd {}\n", shell_words::quote(&dir));
    for env_file in ["~/.powconfig", ".env", ".powrc", ".powenv"] {
        script.push_str(&format!(
            "if test -e {f}; then\n  . {f}\nfi\n",
            f = env_file
        ));
    }
    script.push_str(start);
    script.push('\n');
    script
}

async fn read_output<R>(reader: R, tx: mpsc::Sender<String>) -> Result<(), AppError>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "App output read failed");
                break;
            }
        }
    }
    Ok(())
}

/// Exit watcher: records output, notices an unexpected exit, and tears the
/// app down once it is dying.
async fn supervise(
    app: Arc<App>,
    pool: Arc<AppPool>,
    mut child: Child,
    mut output: mpsc::Receiver<String>,
) -> Result<(), AppError> {
    let mut open = true;
    loop {
        tokio::select! {
            _ = app.lifecycle.dying() => break,
            line = output.recv() => match line {
                Some(line) => app.record_output(&line),
                None => {
                    open = false;
                    app.lifecycle.kill(AppError::UnexpectedExit {
                        last_line: app.last_log_line(),
                    });
                    app.kill("stdout/stderr closed");
                    break;
                }
            },
        }
    }

    app.kill("detected internal shutdown");

    // Keep draining output so the final lines land in the log
    let exit = child.wait();
    tokio::pin!(exit);
    let status = loop {
        tokio::select! {
            status = &mut exit => break status,
            line = output.recv(), if open => match line {
                Some(line) => app.record_output(&line),
                None => open = false,
            },
        }
    };
    match status {
        Ok(status) => debug!(app = %app.name, ?status, "App process exited"),
        Err(e) => warn!(app = %app.name, error = %e, "Error waiting for app to exit"),
    }

    pool.remove(&app);

    if app.scheme == Scheme::Unix {
        let _ = tokio::fs::remove_file(&app.host).await;
    }

    app.event_add("shutdown", &[]);
    info!(app = %app.name, "App shutdown and cleaned up");

    Ok(())
}

async fn idle_monitor(app: Arc<App>, pool: Arc<AppPool>) -> Result<(), AppError> {
    let period = pool.idle_check_interval();
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = app.lifecycle.dying() => return Ok(()),
            _ = ticker.tick() => {
                if pool.maybe_idle(&app) {
                    app.kill("app is idle");
                    return Ok(());
                }
            }
        }
    }
}

async fn restart_monitor(app: Arc<App>) -> Result<(), AppError> {
    let restart = app.dir.join("tmp").join("restart.txt");
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&restart)
        .map_err(|e| AppError::io(format!("creating {}", restart.display()), e))?;

    let watcher = RestartWatcher::new(&restart);
    watcher
        .run(app.lifecycle.token(), || app.kill("restart.txt touched"))
        .await
        .map_err(|e| AppError::io(format!("watching {}", restart.display()), e))
}

async fn boot_poller(app: Arc<App>, socket: PathBuf, boot_timeout: Duration) -> Result<(), AppError> {
    app.event_add("waiting_on_app", &[]);

    let deadline = tokio::time::sleep(boot_timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = app.lifecycle.dying() => {
                app.event_add("dying_on_start", &[]);
                return Err(AppError::DiedBeforeBoot);
            }
            _ = &mut deadline => {
                warn!(app = %app.name, timeout = ?boot_timeout, "App did not boot in time");
                return Err(AppError::BootTimeout { timeout: boot_timeout });
            }
            _ = tokio::time::sleep(BOOT_POLL_INTERVAL) => {
                if UnixStream::connect(&socket).await.is_ok() {
                    app.mark_ready();
                    app.event_add("app_ready", &[]);
                    info!(app = %app.name, "App ready");
                    return Ok(());
                }
            }
        }
    }
}
