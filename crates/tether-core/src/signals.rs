//! Process-wide OS signal dispatch.
//!
//! A [`SignalDispatcher`] maps signal names to an ordered list of handlers.
//! The first registration for a signal installs the native handler through a
//! [`NativeSignalBridge`]; later registrations only append to the list.
//!
//! On delivery every handler runs in registration order and receives the
//! signal name. A handler may return an exit code: the first one that does
//! terminates the process through the [`ProcessExit`] adapter and the
//! remaining handlers are skipped. Panicking handlers are caught and
//! dispatch continues with the next one.
//!
//! # Example
//!
//! ```no_run
//! use tether_core::signals::SignalDispatcher;
//!
//! let signals = SignalDispatcher::global();
//!
//! signals.register("HUP", |name| {
//!     println!("reloading after {name}");
//!     None
//! });
//!
//! let accepted = signals.register_all(&["TERM", "USR1", "BOGUS"], |_| Some(0));
//! assert_eq!(accepted, vec!["TERM".to_string(), "USR1".to_string()]);
//! ```
//!
//! Tests construct their own dispatcher with
//! [`SignalDispatcher::with_adapters`] and call
//! [`dispatch`](SignalDispatcher::dispatch) directly, so no real signal is
//! ever raised.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;

use crate::error::{SignalError, panic_message};
use crate::logging::targets;

/// Global dispatcher instance.
static GLOBAL_DISPATCHER: OnceLock<SignalDispatcher> = OnceLock::new();

/// The OS signals an application may handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SignalKind {
    /// Terminal hang-up, conventionally "reload configuration".
    Hup,
    /// Trace/breakpoint trap.
    Trap,
    /// Abort.
    Abrt,
    /// Write to a pipe with no reader.
    Pipe,
    /// Timer alarm.
    Alrm,
    /// Termination request.
    Term,
    /// Child process status change.
    Chld,
    /// Background read from the terminal.
    Ttin,
    /// Background write to the terminal.
    Ttou,
    /// Profiling timer expired.
    Prof,
    /// Terminal window size change.
    Winch,
    /// User-defined signal 1.
    Usr1,
    /// User-defined signal 2.
    Usr2,
}

impl SignalKind {
    /// Every supported signal.
    pub const ALL: [SignalKind; 13] = [
        Self::Hup,
        Self::Trap,
        Self::Abrt,
        Self::Pipe,
        Self::Alrm,
        Self::Term,
        Self::Chld,
        Self::Ttin,
        Self::Ttou,
        Self::Prof,
        Self::Winch,
        Self::Usr1,
        Self::Usr2,
    ];

    /// The signal name without the `SIG` prefix.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hup => "HUP",
            Self::Trap => "TRAP",
            Self::Abrt => "ABRT",
            Self::Pipe => "PIPE",
            Self::Alrm => "ALRM",
            Self::Term => "TERM",
            Self::Chld => "CHLD",
            Self::Ttin => "TTIN",
            Self::Ttou => "TTOU",
            Self::Prof => "PROF",
            Self::Winch => "WINCH",
            Self::Usr1 => "USR1",
            Self::Usr2 => "USR2",
        }
    }

    /// The platform signal number.
    #[cfg(unix)]
    pub fn raw(&self) -> std::os::raw::c_int {
        use signal_hook::consts;
        match self {
            Self::Hup => consts::SIGHUP,
            Self::Trap => consts::SIGTRAP,
            Self::Abrt => consts::SIGABRT,
            Self::Pipe => consts::SIGPIPE,
            Self::Alrm => consts::SIGALRM,
            Self::Term => consts::SIGTERM,
            Self::Chld => consts::SIGCHLD,
            Self::Ttin => consts::SIGTTIN,
            Self::Ttou => consts::SIGTTOU,
            Self::Prof => consts::SIGPROF,
            Self::Winch => consts::SIGWINCH,
            Self::Usr1 => consts::SIGUSR1,
            Self::Usr2 => consts::SIGUSR2,
        }
    }
}

impl FromStr for SignalKind {
    type Err = SignalError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == name)
            .ok_or_else(|| SignalError::Unsupported(name.to_string()))
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An application handler: receives the signal name, may return an exit code.
pub type SignalHandler = Arc<dyn Fn(&str) -> Option<i32> + Send + Sync>;

/// Callback a bridge invokes when a bound signal is delivered.
pub type DeliveryFn = Arc<dyn Fn(SignalKind) + Send + Sync>;

/// Installs native OS handlers on behalf of a dispatcher.
///
/// `bind` is called at most once per signal kind for a dispatcher's lifetime.
pub trait NativeSignalBridge: Send + Sync {
    /// Install the native handler for `kind`, routing deliveries to `deliver`.
    fn bind(&self, kind: SignalKind, deliver: DeliveryFn) -> Result<(), SignalError>;
}

/// Terminates the process on behalf of a dispatcher.
pub trait ProcessExit: Send + Sync {
    /// Exit with `code`.
    fn exit(&self, code: i32);
}

/// Exits through [`std::process::exit`].
#[derive(Debug, Default, Clone, Copy)]
pub struct StdProcessExit;

impl ProcessExit for StdProcessExit {
    fn exit(&self, code: i32) {
        tracing::debug!(target: targets::SIGNALS, code, "exiting on signal");
        std::process::exit(code);
    }
}

#[cfg(unix)]
pub use hook::SignalHookBridge;

#[cfg(unix)]
mod hook {
    use std::collections::HashMap;
    use std::os::raw::c_int;
    use std::sync::Arc;
    use std::thread;

    use parking_lot::Mutex;
    use signal_hook::iterator::{Handle, Signals};

    use super::{DeliveryFn, NativeSignalBridge, SignalKind};
    use crate::error::SignalError;
    use crate::logging::targets;

    type Routes = Arc<Mutex<HashMap<c_int, (SignalKind, DeliveryFn)>>>;

    /// Bridge backed by a `signal-hook` iterator on a dedicated thread.
    ///
    /// The thread is started by the first `bind` and keeps running for the
    /// process lifetime; every later `bind` adds one signal to its set.
    #[derive(Default)]
    pub struct SignalHookBridge {
        listener: Mutex<Option<(Handle, Routes)>>,
    }

    impl SignalHookBridge {
        /// Create a bridge; no thread is started until the first bind.
        pub fn new() -> Self {
            Self::default()
        }

        fn start(kind: SignalKind) -> Result<(Handle, Routes), SignalError> {
            let mut signals = Signals::new(Vec::<c_int>::new())
                .map_err(|e| SignalError::bind_failed(kind.as_str(), e.to_string()))?;
            let handle = signals.handle();
            let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
            let thread_routes = routes.clone();

            thread::Builder::new()
                .name("tether-signals".to_string())
                .spawn(move || {
                    for raw in signals.forever() {
                        // Clone out so the route lock isn't held while handlers run.
                        let route = thread_routes.lock().get(&raw).cloned();
                        if let Some((kind, deliver)) = route {
                            deliver(kind);
                        }
                    }
                })
                .map_err(|e| SignalError::bind_failed(kind.as_str(), e.to_string()))?;

            tracing::debug!(target: targets::SIGNALS, "signal listener thread started");
            Ok((handle, routes))
        }
    }

    impl NativeSignalBridge for SignalHookBridge {
        fn bind(&self, kind: SignalKind, deliver: DeliveryFn) -> Result<(), SignalError> {
            let mut listener = self.listener.lock();
            if listener.is_none() {
                *listener = Some(Self::start(kind)?);
            }
            let Some((handle, routes)) = listener.as_ref() else {
                return Err(SignalError::bind_failed(kind.as_str(), "listener unavailable"));
            };

            routes.lock().insert(kind.raw(), (kind, deliver));
            if let Err(e) = handle.add_signal(kind.raw()) {
                routes.lock().remove(&kind.raw());
                return Err(SignalError::bind_failed(kind.as_str(), e.to_string()));
            }
            Ok(())
        }
    }
}

/// Bridge for platforms without POSIX signals: every bind fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedBridge;

impl NativeSignalBridge for UnsupportedBridge {
    fn bind(&self, kind: SignalKind, _deliver: DeliveryFn) -> Result<(), SignalError> {
        Err(SignalError::bind_failed(
            kind.as_str(),
            "signals are not supported on this platform",
        ))
    }
}

struct DispatcherInner {
    handlers: Mutex<HashMap<SignalKind, Vec<SignalHandler>>>,
    bound: Mutex<Vec<SignalKind>>,
    bridge: Box<dyn NativeSignalBridge>,
    exit: Box<dyn ProcessExit>,
}

impl DispatcherInner {
    fn dispatch(&self, kind: SignalKind) -> Option<i32> {
        let handlers = self.handlers.lock().get(&kind).cloned().unwrap_or_default();
        tracing::debug!(
            target: targets::SIGNALS,
            signal = kind.as_str(),
            handlers = handlers.len(),
            "dispatching signal"
        );

        for handler in handlers {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(kind.as_str()))) {
                Ok(Some(code)) => {
                    self.exit.exit(code);
                    return Some(code);
                }
                Ok(None) => {}
                Err(payload) => {
                    tracing::debug!(
                        target: targets::SIGNALS,
                        signal = kind.as_str(),
                        panic = %panic_message(&*payload),
                        "signal handler panicked"
                    );
                }
            }
        }
        None
    }
}

/// Registry of application signal handlers.
///
/// Cloning is cheap; clones share the same registry.
#[derive(Clone)]
pub struct SignalDispatcher {
    inner: Arc<DispatcherInner>,
}

impl SignalDispatcher {
    /// The process-wide dispatcher, bound to the real OS signals.
    pub fn global() -> &'static SignalDispatcher {
        GLOBAL_DISPATCHER.get_or_init(Self::new)
    }

    /// Create a dispatcher using the platform bridge and `std::process::exit`.
    ///
    /// Prefer [`global`](Self::global): two dispatchers binding the same
    /// signal would each receive it.
    pub fn new() -> Self {
        #[cfg(unix)]
        let bridge: Box<dyn NativeSignalBridge> = Box::new(SignalHookBridge::new());
        #[cfg(not(unix))]
        let bridge: Box<dyn NativeSignalBridge> = Box::new(UnsupportedBridge);

        Self::with_adapters(bridge, Box::new(StdProcessExit))
    }

    /// Create a dispatcher with custom native and exit adapters.
    pub fn with_adapters(bridge: Box<dyn NativeSignalBridge>, exit: Box<dyn ProcessExit>) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                handlers: Mutex::new(HashMap::new()),
                bound: Mutex::new(Vec::new()),
                bridge,
                exit,
            }),
        }
    }

    /// Register `handler` for the named signal.
    ///
    /// Returns `false`, without binding anything, if the name is not a
    /// supported signal or the native handler could not be installed.
    pub fn register<F>(&self, signal: &str, handler: F) -> bool
    where
        F: Fn(&str) -> Option<i32> + Send + Sync + 'static,
    {
        self.register_handler(signal, Arc::new(handler))
    }

    /// Register one handler for several signals.
    ///
    /// Returns the names that were accepted, in input order.
    pub fn register_all<S, F>(&self, signals: &[S], handler: F) -> Vec<String>
    where
        S: AsRef<str>,
        F: Fn(&str) -> Option<i32> + Send + Sync + 'static,
    {
        let handler: SignalHandler = Arc::new(handler);
        signals
            .iter()
            .map(AsRef::as_ref)
            .filter(|name| self.register_handler(name, handler.clone()))
            .map(str::to_string)
            .collect()
    }

    /// Register an already shared handler.
    pub fn register_handler(&self, signal: &str, handler: SignalHandler) -> bool {
        let kind = match signal.parse::<SignalKind>() {
            Ok(kind) => kind,
            Err(err) => {
                tracing::debug!(target: targets::SIGNALS, error = %err, "registration refused");
                return false;
            }
        };

        self.inner
            .handlers
            .lock()
            .entry(kind)
            .or_default()
            .push(handler.clone());

        match self.ensure_bound(kind) {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!(target: targets::SIGNALS, error = %err, "registration failed");
                let mut handlers = self.inner.handlers.lock();
                if let Some(list) = handlers.get_mut(&kind) {
                    list.retain(|h| !Arc::ptr_eq(h, &handler));
                    if list.is_empty() {
                        handlers.remove(&kind);
                    }
                }
                false
            }
        }
    }

    /// Run the handlers for `kind` as if the signal had been delivered.
    ///
    /// Returns the exit code that terminated dispatch, if any.
    pub fn dispatch(&self, kind: SignalKind) -> Option<i32> {
        self.inner.dispatch(kind)
    }

    /// Number of handlers registered for the named signal.
    pub fn handler_count(&self, signal: &str) -> usize {
        signal
            .parse::<SignalKind>()
            .ok()
            .and_then(|kind| self.inner.handlers.lock().get(&kind).map(Vec::len))
            .unwrap_or(0)
    }

    /// Signals that currently have at least one handler, sorted by name.
    pub fn registered_signals(&self) -> Vec<SignalKind> {
        let mut kinds: Vec<_> = self.inner.handlers.lock().keys().copied().collect();
        kinds.sort_by_key(|kind| kind.as_str());
        kinds
    }

    fn ensure_bound(&self, kind: SignalKind) -> Result<(), SignalError> {
        // Held across the bind so concurrent registrations bind at most once.
        let mut bound = self.inner.bound.lock();
        if bound.contains(&kind) {
            return Ok(());
        }

        let weak: Weak<DispatcherInner> = Arc::downgrade(&self.inner);
        let deliver: DeliveryFn = Arc::new(move |kind| {
            if let Some(inner) = weak.upgrade() {
                inner.dispatch(kind);
            }
        });

        self.inner.bridge.bind(kind, deliver)?;
        bound.push(kind);
        tracing::debug!(target: targets::SIGNALS, signal = kind.as_str(), "native handler bound");
        Ok(())
    }
}

impl Default for SignalDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SignalDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers = self.inner.handlers.lock();
        let mut entries: Vec<_> = handlers
            .iter()
            .map(|(kind, list)| (kind.as_str(), list.len()))
            .collect();
        entries.sort();

        write!(f, "Signals{{")?;
        for (i, (name, count)) in entries.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{name}:{count}")?;
        }
        write!(f, "}}")
    }
}

impl fmt::Debug for SignalDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalDispatcher")
            .field("registered", &self.registered_signals())
            .finish_non_exhaustive()
    }
}

static_assertions::assert_impl_all!(SignalDispatcher: Send, Sync);
