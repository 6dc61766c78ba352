use log::{LevelFilter, Metadata, Record};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::{Mutex, MutexGuard, OnceLock};

/// environment variable holding the max level, one of `off`, `error`, `warn`, `info`, `debug`
/// or `trace`
pub const LEVEL_ENV: &str = "LOGCLEAN_LOG";

static G_LOGGER: OnceLock<Logger> = OnceLock::new();

const G_CONSOLE: &str = "console";
const G_FILE: &str = "file";

/// a simple sync logger which impl log::Log
pub struct Logger {
    sinks: Mutex<Vec<Box<dyn Sink>>>,
    abort_on_error: AtomicBool,
}

trait Sink: Send {
    fn sink(&mut self, line: &str);

    fn flush(&mut self);

    fn name(&self) -> &'static str;
}

struct Console;

impl Sink for Console {
    fn sink(&mut self, line: &str) {
        let _ = std::io::stdout().write_all(line.as_bytes());
    }

    fn flush(&mut self) {
        let _ = std::io::stdout().flush();
    }

    fn name(&self) -> &'static str {
        G_CONSOLE
    }
}

/// NOTE: file rolling is not supported
struct File {
    w: std::fs::File,
}

impl File {
    fn new(path: impl AsRef<Path>, trunc: bool) -> std::io::Result<Self> {
        let mut ops = std::fs::File::options();
        ops.write(true).create(true);
        if trunc {
            ops.truncate(true);
        } else {
            ops.append(true);
        }
        ops.open(path).map(|w| Self { w })
    }
}

impl Sink for File {
    fn sink(&mut self, line: &str) {
        let _ = self.w.write_all(line.as_bytes());
    }

    fn flush(&mut self) {
        let _ = self.w.flush();
    }

    fn name(&self) -> &'static str {
        G_FILE
    }
}

fn thread_name() -> String {
    let t = std::thread::current();
    match t.name() {
        Some(n) => n.to_string(),
        None => format!("{:?}", t.id()),
    }
}

fn level_from_env() -> LevelFilter {
    std::env::var(LEVEL_ENV)
        .ok()
        .and_then(|x| x.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info)
}

impl log::Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let s = format!(
            "{} {} [{}] {}:{} {}\n",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S.%6f"),
            thread_name(),
            record.level().as_str(),
            record.file().unwrap_or("?"),
            record.line().unwrap_or(0),
            record.args()
        );
        let mut sinks = self.lock();
        for p in sinks.iter_mut() {
            p.sink(&s);
        }

        if record.level() == log::Level::Error && self.abort_on_error.load(Relaxed) {
            let bt = std::backtrace::Backtrace::force_capture();
            let buf = format!("{}", bt);
            for p in sinks.iter_mut() {
                p.sink(&buf);
                p.flush();
            }
            std::process::abort();
        }
    }

    fn flush(&self) {
        for p in self.lock().iter_mut() {
            p.flush();
        }
    }
}

impl Logger {
    /// install the logger once, later calls return the installed instance
    pub fn init() -> &'static Self {
        let mut fresh = false;
        let l = G_LOGGER.get_or_init(|| {
            fresh = true;
            Logger {
                sinks: Mutex::new(Vec::new()),
                abort_on_error: AtomicBool::new(false),
            }
        });
        if fresh && log::set_logger(l).is_ok() {
            log::set_max_level(level_from_env());
        }
        l
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Box<dyn Sink>>> {
        self.sinks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn exist(&self, name: &'static str) -> bool {
        self.lock().iter().any(|x| x.name() == name)
    }

    pub fn abort_on_error(&self, flag: bool) -> &Self {
        self.abort_on_error.store(flag, Relaxed);
        self
    }

    pub fn set_level(&self, level: LevelFilter) -> &Self {
        log::set_max_level(level);
        self
    }

    pub fn add_console(&self) -> &Self {
        if !self.exist(G_CONSOLE) {
            self.lock().push(Box::new(Console));
        }
        self
    }

    pub fn add_file(&self, path: impl AsRef<Path>, trunc: bool) -> Option<&Self> {
        if self.exist(G_FILE) {
            return Some(self);
        }
        match File::new(&path, trunc) {
            Err(e) => {
                eprintln!("can't open {}, error {}", path.as_ref().display(), e);
                None
            }
            Ok(f) => {
                self.lock().push(Box::new(f));
                Some(self)
            }
        }
    }

    fn remove(&self, name: &'static str) {
        self.lock().retain(|x| x.name() != name);
    }

    pub fn remove_file(&self) {
        self.remove(G_FILE);
    }

    pub fn remove_console(&self) {
        self.remove(G_CONSOLE);
    }
}

#[cfg(test)]
mod test {
    use crate::Logger;

    #[test]
    fn install_once() {
        let l = Logger::init();
        let again = Logger::init();
        assert!(std::ptr::eq(l, again));

        let p = log::logger() as *const dyn log::Log;
        let q = l as *const dyn log::Log;
        assert!(std::ptr::addr_eq(p, q));

        l.add_console().add_console();
        l.remove_console();
        l.remove_console();
    }
}
