//! Duplex relay — copies bytes between the client (`near`) and destination
//! (`far`) streams until either direction terminates.
//!
//! Each direction runs in its own spawned task. Both tasks race to report a
//! [`RelayOutcome`]; an [`OutcomeLatch`] delivers only the first report and
//! raises a stop signal so the surviving direction winds down as well. The
//! tasks hand their stream halves back on exit, so [`DuplexRelay::close`] can
//! return the reassembled streams to the caller.
//!
//! Two strategies exist:
//!
//! - [`RelayStrategy::Bytewise`] (default): strips telnet control octets on
//!   client→destination and refreshes both legs' idle deadlines after every
//!   forward. Reads are batched, but filtering and deadline refresh keep
//!   per-byte semantics.
//! - [`RelayStrategy::Bulk`]: `tokio::io::copy` in each direction with no
//!   filter; each direction's deadline is fixed once when the relay starts.

use serde::Deserialize;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tproxy_core::{is_control_byte, ProxyError, ProxyResult};
use tracing::debug;

/// Read size for the byte-wise strategy.
const BYTEWISE_CHUNK: usize = 1024;

/// Stand-in for "never" when `now + timeout` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Which leg of the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Destination,
}

impl Side {
    /// The opposite leg.
    pub fn peer(self) -> Side {
        match self {
            Side::Client => Side::Destination,
            Side::Destination => Side::Client,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Client => f.write_str("client"),
            Side::Destination => f.write_str("destination"),
        }
    }
}

/// The single terminal result of a relay run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// The leg on `side` reached EOF.
    NormalClose { side: Side, reason: String },
    /// A read or write on `side` failed, idle timeouts included.
    Error {
        side: Side,
        kind: io::ErrorKind,
        cause: String,
    },
}

impl RelayOutcome {
    /// The leg that initiated termination.
    pub fn side(&self) -> Side {
        match self {
            RelayOutcome::NormalClose { side, .. } | RelayOutcome::Error { side, .. } => *side,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RelayOutcome::Error { .. })
    }

    /// Whether the relay ended because a leg's idle deadline elapsed.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            RelayOutcome::Error {
                kind: io::ErrorKind::TimedOut,
                ..
            }
        )
    }
}

impl fmt::Display for RelayOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayOutcome::NormalClose { reason, .. } => f.write_str(reason),
            RelayOutcome::Error { cause, .. } => f.write_str(cause),
        }
    }
}

/// Idle timeouts for the two legs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayTimeouts {
    pub client: Duration,
    pub destination: Duration,
}

impl RelayTimeouts {
    pub fn for_side(&self, side: Side) -> Duration {
        match side {
            Side::Client => self.client,
            Side::Destination => self.destination,
        }
    }
}

/// How bytes are moved between the legs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayStrategy {
    /// Filtered, with idle deadlines refreshed on activity.
    #[default]
    Bytewise,
    /// Unfiltered bulk copy with a deadline fixed at start.
    Bulk,
}

/// One-shot delivery of the relay outcome.
///
/// The `fired` flag is checked before the sender slot is touched, so late
/// reports return immediately without locking or blocking.
struct OutcomeLatch {
    fired: AtomicBool,
    tx: Mutex<Option<oneshot::Sender<RelayOutcome>>>,
}

impl OutcomeLatch {
    fn new() -> (Self, oneshot::Receiver<RelayOutcome>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                fired: AtomicBool::new(false),
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Deliver `outcome` if nothing has been reported yet. Returns whether
    /// this call was the one that fired the latch.
    fn report(&self, outcome: RelayOutcome) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            debug!(outcome = %outcome, "relay outcome discarded, already reported");
            return false;
        }
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = tx {
            // The receiver may be gone if the relay was closed without waiting.
            let _ = tx.send(outcome);
        }
        true
    }
}

/// Current idle deadline of each leg.
struct LegDeadlines {
    timeouts: RelayTimeouts,
    deadlines: Mutex<(Instant, Instant)>,
}

impl LegDeadlines {
    fn new(timeouts: RelayTimeouts) -> Self {
        let now = Instant::now();
        Self {
            timeouts,
            deadlines: Mutex::new((
                deadline_after(now, timeouts.client),
                deadline_after(now, timeouts.destination),
            )),
        }
    }

    fn get(&self, side: Side) -> Instant {
        let deadlines = self.deadlines.lock().unwrap_or_else(PoisonError::into_inner);
        match side {
            Side::Client => deadlines.0,
            Side::Destination => deadlines.1,
        }
    }

    /// Push both legs out to `now + their own timeout`.
    fn refresh(&self) {
        let now = Instant::now();
        let mut deadlines = self.deadlines.lock().unwrap_or_else(PoisonError::into_inner);
        *deadlines = (
            deadline_after(now, self.timeouts.client),
            deadline_after(now, self.timeouts.destination),
        );
    }
}

/// `now + timeout`, saturating at [`FAR_FUTURE`] instead of overflowing.
fn deadline_after(now: Instant, timeout: Duration) -> Instant {
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}

/// State shared by the two direction tasks.
struct RelayShared {
    latch: OutcomeLatch,
    deadlines: LegDeadlines,
    stop: watch::Sender<bool>,
}

impl RelayShared {
    /// Report `outcome` (first caller wins) and tell both directions to stop.
    fn finish(&self, outcome: RelayOutcome) {
        self.latch.report(outcome);
        self.stop.send_replace(true);
    }
}

/// A running duplex relay between `near` (client) and `far` (destination).
pub struct DuplexRelay<N, F> {
    shared: Arc<RelayShared>,
    outcome_rx: Option<oneshot::Receiver<RelayOutcome>>,
    near_to_far: JoinHandle<(ReadHalf<N>, WriteHalf<F>)>,
    far_to_near: JoinHandle<(ReadHalf<F>, WriteHalf<N>)>,
}

impl<N, F> DuplexRelay<N, F>
where
    N: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    F: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Spawn both copy directions and return immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(near: N, far: F, timeouts: RelayTimeouts, strategy: RelayStrategy) -> Self {
        let (latch, outcome_rx) = OutcomeLatch::new();
        let (stop, _) = watch::channel(false);
        let shared = Arc::new(RelayShared {
            latch,
            deadlines: LegDeadlines::new(timeouts),
            stop,
        });

        let (near_rd, near_wr) = tokio::io::split(near);
        let (far_rd, far_wr) = tokio::io::split(far);

        let (near_to_far, far_to_near) = match strategy {
            RelayStrategy::Bytewise => (
                tokio::spawn(pump_bytewise(near_rd, far_wr, Side::Client, shared.clone())),
                tokio::spawn(pump_bytewise(far_rd, near_wr, Side::Destination, shared.clone())),
            ),
            RelayStrategy::Bulk => (
                tokio::spawn(pump_bulk(near_rd, far_wr, Side::Client, shared.clone())),
                tokio::spawn(pump_bulk(far_rd, near_wr, Side::Destination, shared.clone())),
            ),
        };

        debug!(?strategy, ?timeouts, "relay started");

        Self {
            shared,
            outcome_rx: Some(outcome_rx),
            near_to_far,
            far_to_near,
        }
    }

    /// Wait for the relay's single outcome.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Relay`] if called a second time, or if both
    /// directions exited without reporting (only possible after `close`).
    pub async fn wait(&mut self) -> ProxyResult<RelayOutcome> {
        let rx = self
            .outcome_rx
            .take()
            .ok_or_else(|| ProxyError::Relay("relay outcome already taken".into()))?;
        rx.await
            .map_err(|_| ProxyError::Relay("relay ended without an outcome".into()))
    }

    /// Stop both directions and hand back `(near, far)`.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Relay`] if a direction task panicked.
    pub async fn close(self) -> ProxyResult<(N, F)> {
        self.shared.stop.send_replace(true);

        let (near_rd, far_wr) = self
            .near_to_far
            .await
            .map_err(|e| ProxyError::Relay(format!("client direction failed: {e}")))?;
        let (far_rd, near_wr) = self
            .far_to_near
            .await
            .map_err(|e| ProxyError::Relay(format!("destination direction failed: {e}")))?;

        Ok((near_rd.unsplit(near_wr), far_rd.unsplit(far_wr)))
    }
}

/// Byte-wise copy from leg `from` to its peer.
async fn pump_bytewise<R, W>(
    mut src: R,
    mut dst: W,
    from: Side,
    shared: Arc<RelayShared>,
) -> (R, W)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let to = from.peer();
    let filter = from == Side::Client;
    let mut stop = shared.stop.subscribe();
    let mut buf = [0u8; BYTEWISE_CHUNK];
    let mut out = Vec::with_capacity(BYTEWISE_CHUNK);

    loop {
        let read = tokio::select! {
            biased;
            _ = stop.wait_for(|stopped| *stopped) => break,
            r = read_before_deadline(&mut src, &mut buf, &shared.deadlines, from) => r,
        };

        let n = match read {
            Ok(0) => {
                shared.finish(RelayOutcome::NormalClose {
                    side: from,
                    reason: format!("EOF signal from {from}"),
                });
                break;
            }
            Ok(n) => n,
            Err(e) => {
                shared.finish(RelayOutcome::Error {
                    side: from,
                    kind: e.kind(),
                    cause: format!("error read from {from}: {e}"),
                });
                break;
            }
        };

        out.clear();
        out.extend(
            buf[..n]
                .iter()
                .copied()
                .filter(|b| !(filter && is_control_byte(*b))),
        );
        if out.is_empty() {
            continue;
        }

        let write = tokio::select! {
            biased;
            _ = stop.wait_for(|stopped| *stopped) => break,
            w = write_before_deadline(&mut dst, &out, &shared.deadlines, to) => w,
        };
        if let Err(e) = write {
            shared.finish(RelayOutcome::Error {
                side: to,
                kind: e.kind(),
                cause: format!("error writing to {to}: {e}"),
            });
            break;
        }

        shared.deadlines.refresh();
    }

    debug!(direction = %from, "relay direction ended");
    (src, dst)
}

/// Bulk copy from leg `from` to its peer, bounded by a deadline fixed now.
async fn pump_bulk<R, W>(mut src: R, mut dst: W, from: Side, shared: Arc<RelayShared>) -> (R, W)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut stop = shared.stop.subscribe();
    let deadline = deadline_after(Instant::now(), shared.deadlines.timeouts.for_side(from));

    let copied = tokio::select! {
        biased;
        _ = stop.wait_for(|stopped| *stopped) => None,
        r = tokio::time::timeout_at(deadline, tokio::io::copy(&mut src, &mut dst)) => Some(r),
    };

    match copied {
        None => {}
        Some(Ok(Ok(bytes))) => {
            debug!(direction = %from, bytes, "bulk copy reached EOF");
            shared.finish(RelayOutcome::NormalClose {
                side: from,
                reason: "connection is closed by foreign host".to_string(),
            });
        }
        Some(Ok(Err(e))) => shared.finish(RelayOutcome::Error {
            side: from,
            kind: e.kind(),
            cause: format!("error copying from {from}: {e}"),
        }),
        Some(Err(_)) => shared.finish(RelayOutcome::Error {
            side: from,
            kind: io::ErrorKind::TimedOut,
            cause: format!("{from} deadline exceeded"),
        }),
    }

    debug!(direction = %from, "relay direction ended");
    (src, dst)
}

/// Read into `buf`, failing with `TimedOut` once `leg`'s deadline has passed.
/// The deadline is re-read after each wakeup because the other direction may
/// have pushed it out in the meantime.
async fn read_before_deadline<R: AsyncRead + Unpin>(
    src: &mut R,
    buf: &mut [u8],
    deadlines: &LegDeadlines,
    leg: Side,
) -> io::Result<usize> {
    loop {
        let deadline = deadlines.get(leg);
        match tokio::time::timeout_at(deadline, src.read(buf)).await {
            Ok(result) => return result,
            Err(_) if deadlines.get(leg) <= Instant::now() => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("{leg} idle timeout"),
                ));
            }
            Err(_) => continue,
        }
    }
}

async fn write_before_deadline<W: AsyncWrite + Unpin>(
    dst: &mut W,
    data: &[u8],
    deadlines: &LegDeadlines,
    leg: Side,
) -> io::Result<()> {
    let deadline = deadlines.get(leg);
    match tokio::time::timeout_at(deadline, async {
        dst.write_all(data).await?;
        dst.flush().await
    })
    .await
    {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("{leg} write timeout"),
        )),
    }
}
