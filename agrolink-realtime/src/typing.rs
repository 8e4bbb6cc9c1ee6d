//! Typing indicators.
//!
//! [`TypingDebouncer`] turns local keystrokes into `Started` / `Stopped`
//! signals: the first keystroke starts typing, every keystroke restarts a
//! quiet-period countdown, and the countdown expiring stops typing. One
//! countdown per room; a newer call always supersedes the older one.
//!
//! Keystrokes and explicit stops answer synchronously with the signal to
//! send, so the caller can put it on the wire in call order. Only countdown
//! expiry is delivered later, on the receiver returned by
//! [`TypingDebouncer::new`].
//!
//! [`RemoteTyping`] tracks what other participants are doing, with the same
//! quiet-period expiry applied lazily on read.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Output of the debouncer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypingSignal {
    Started(String),
    Stopped(String),
}

impl TypingSignal {
    /// Room the signal belongs to.
    pub fn room(&self) -> &str {
        match self {
            TypingSignal::Started(room) | TypingSignal::Stopped(room) => room,
        }
    }
}

struct Countdown {
    generation: u64,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct Countdowns {
    next_generation: u64,
    active: HashMap<String, Countdown>,
}

fn lock(countdowns: &Mutex<Countdowns>) -> MutexGuard<'_, Countdowns> {
    countdowns.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Debounces local typing into start/stop signals.
///
/// Must be used from within a Tokio runtime (countdowns are spawned tasks).
pub struct TypingDebouncer {
    quiet: Duration,
    countdowns: Arc<Mutex<Countdowns>>,
    expired: mpsc::UnboundedSender<TypingSignal>,
}

impl TypingDebouncer {
    /// Create a debouncer and the receiver countdown expiries are delivered
    /// to (always `Stopped`).
    pub fn new(quiet: Duration) -> (Self, mpsc::UnboundedReceiver<TypingSignal>) {
        let (expired, rx) = mpsc::unbounded_channel();
        let debouncer = Self {
            quiet,
            countdowns: Arc::new(Mutex::new(Countdowns::default())),
            expired,
        };
        (debouncer, rx)
    }

    pub fn quiet_period(&self) -> Duration {
        self.quiet
    }

    /// A keystroke in `room`: restart the countdown.
    ///
    /// Returns `Started` for the first keystroke, `None` while already typing.
    pub fn notify_typing(&self, room: &str) -> Option<TypingSignal> {
        let mut countdowns = lock(&self.countdowns);
        countdowns.next_generation += 1;
        let generation = countdowns.next_generation;

        let signal = match countdowns.active.remove(room) {
            Some(previous) => {
                previous.timer.abort();
                None
            }
            None => {
                log::trace!("Typing started in {room}");
                Some(TypingSignal::Started(room.to_string()))
            }
        };

        let timer = tokio::spawn(expire(
            Arc::clone(&self.countdowns),
            self.expired.clone(),
            room.to_string(),
            generation,
            self.quiet,
        ));
        countdowns
            .active
            .insert(room.to_string(), Countdown { generation, timer });
        signal
    }

    /// Stop typing now (message sent, input cleared).
    ///
    /// Returns `Stopped` if `room` was typing, `None` otherwise.
    pub fn notify_stop_typing(&self, room: &str) -> Option<TypingSignal> {
        let countdown = lock(&self.countdowns).active.remove(room)?;
        countdown.timer.abort();
        log::trace!("Typing stopped in {room}");
        Some(TypingSignal::Stopped(room.to_string()))
    }

    /// Discard the countdown for `room` without emitting anything.
    pub fn cancel(&self, room: &str) -> bool {
        match lock(&self.countdowns).active.remove(room) {
            Some(countdown) => {
                countdown.timer.abort();
                true
            }
            None => false,
        }
    }

    /// Discard every countdown without emitting anything.
    pub fn cancel_all(&self) {
        let mut countdowns = lock(&self.countdowns);
        for (_, countdown) in countdowns.active.drain() {
            countdown.timer.abort();
        }
    }

    /// Whether a countdown is running for `room`.
    pub fn is_typing(&self, room: &str) -> bool {
        lock(&self.countdowns).active.contains_key(room)
    }

    /// Number of rooms with a running countdown.
    pub fn active_count(&self) -> usize {
        lock(&self.countdowns).active.len()
    }
}

impl Drop for TypingDebouncer {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

async fn expire(
    countdowns: Arc<Mutex<Countdowns>>,
    expired: mpsc::UnboundedSender<TypingSignal>,
    room: String,
    generation: u64,
    quiet: Duration,
) {
    tokio::time::sleep(quiet).await;

    let mut countdowns = lock(&countdowns);
    // A newer keystroke or a cancel may have replaced us after the sleep
    // completed but before we got the lock.
    let current = countdowns
        .active
        .get(&room)
        .is_some_and(|c| c.generation == generation);
    if current {
        countdowns.active.remove(&room);
        log::trace!("Typing expired in {room}");
        let _ = expired.send(TypingSignal::Stopped(room));
    }
}

#[derive(Debug, Clone)]
struct RemoteTypist {
    user_id: Option<String>,
    since: Instant,
}

/// Typing state of remote participants, one flag per room.
#[derive(Debug, Clone)]
pub struct RemoteTyping {
    quiet: Duration,
    rooms: HashMap<String, RemoteTypist>,
}

impl RemoteTyping {
    pub fn new(quiet: Duration) -> Self {
        Self {
            quiet,
            rooms: HashMap::new(),
        }
    }

    /// Inbound `typing`. Returns `true` if the room was not typing before.
    pub fn mark_typing(&mut self, room: &str, user_id: Option<String>, now: Instant) -> bool {
        let was_typing = self.is_typing(room, now);
        self.rooms
            .insert(room.to_string(), RemoteTypist { user_id, since: now });
        !was_typing
    }

    /// Inbound `stop_typing`. Stopping an already stopped room is a no-op.
    pub fn mark_stopped(&mut self, room: &str, now: Instant) -> bool {
        let was_typing = self.is_typing(room, now);
        self.rooms.remove(room);
        was_typing
    }

    /// Whether someone is typing in `room` as of `now`.
    pub fn is_typing(&self, room: &str, now: Instant) -> bool {
        self.rooms
            .get(room)
            .is_some_and(|t| now.saturating_duration_since(t.since) < self.quiet)
    }

    /// Who is typing in `room`, if anyone (and if the server said).
    pub fn typist(&self, room: &str, now: Instant) -> Option<&str> {
        if !self.is_typing(room, now) {
            return None;
        }
        self.rooms.get(room).and_then(|t| t.user_id.as_deref())
    }

    /// Rooms with someone typing, sorted.
    pub fn active_rooms(&self, now: Instant) -> Vec<String> {
        let mut rooms: Vec<String> = self
            .rooms
            .keys()
            .filter(|room| self.is_typing(room, now))
            .cloned()
            .collect();
        rooms.sort();
        rooms
    }

    /// Drop the flag for `room` (the local user left it).
    pub fn forget(&mut self, room: &str) {
        self.rooms.remove(room);
    }

    /// Drop every flag (the transport went away).
    pub fn clear(&mut self) {
        self.rooms.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::error::TryRecvError;
    use tokio::time::sleep;

    const QUIET: Duration = Duration::from_secs(3);

    fn drain(rx: &mut mpsc::UnboundedReceiver<TypingSignal>) -> Vec<TypingSignal> {
        let mut out = Vec::new();
        while let Ok(signal) = rx.try_recv() {
            out.push(signal);
        }
        out
    }

    fn started(room: &str) -> Option<TypingSignal> {
        Some(TypingSignal::Started(room.into()))
    }

    fn stopped(room: &str) -> TypingSignal {
        TypingSignal::Stopped(room.into())
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_keystroke_starts_typing() {
        let (debouncer, mut rx) = TypingDebouncer::new(QUIET);
        assert_eq!(debouncer.notify_typing("room-7"), started("room-7"));
        assert_eq!(debouncer.notify_typing("room-7"), None);
        assert!(debouncer.is_typing("room-7"));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keystrokes_within_quiet_period_emit_single_stop() {
        let (debouncer, mut rx) = TypingDebouncer::new(QUIET);

        assert_eq!(debouncer.notify_typing("room-7"), started("room-7"));
        sleep(Duration::from_secs(2)).await;
        assert_eq!(debouncer.notify_typing("room-7"), None);
        sleep(Duration::from_secs(2)).await;

        // 4s after the first call, 2s after the last: still typing.
        assert!(drain(&mut rx).is_empty());

        sleep(Duration::from_millis(1500)).await;
        assert_eq!(drain(&mut rx), vec![stopped("room-7")]);

        sleep(Duration::from_secs(10)).await;
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
        assert!(!debouncer.is_typing("room-7"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_of_keystrokes_never_stops_early() {
        let (debouncer, mut rx) = TypingDebouncer::new(QUIET);
        let mut starts = 0;
        for _ in 0..10 {
            if debouncer.notify_typing("room-7").is_some() {
                starts += 1;
            }
            sleep(Duration::from_millis(2900)).await;
        }
        assert_eq!(starts, 1);
        assert!(drain(&mut rx).is_empty());

        sleep(Duration::from_millis(200)).await;
        assert_eq!(drain(&mut rx), vec![stopped("room-7")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_typing_is_immediate_and_cancels_countdown() {
        let (debouncer, mut rx) = TypingDebouncer::new(QUIET);
        debouncer.notify_typing("room-7");
        assert_eq!(debouncer.notify_stop_typing("room-7"), Some(stopped("room-7")));

        sleep(Duration::from_secs(5)).await;
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(debouncer.notify_typing("room-7"), started("room-7"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_when_idle_is_noop() {
        let (debouncer, mut rx) = TypingDebouncer::new(QUIET);
        assert_eq!(debouncer.notify_stop_typing("room-7"), None);
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_discards_without_signal() {
        let (debouncer, mut rx) = TypingDebouncer::new(QUIET);
        debouncer.notify_typing("room-7");

        assert!(debouncer.cancel("room-7"));
        sleep(Duration::from_secs(5)).await;
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
        assert!(!debouncer.cancel("room-7"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rooms_have_independent_countdowns() {
        let (debouncer, mut rx) = TypingDebouncer::new(QUIET);
        assert_eq!(debouncer.notify_typing("a"), started("a"));
        sleep(Duration::from_secs(2)).await;
        assert_eq!(debouncer.notify_typing("b"), started("b"));
        assert_eq!(debouncer.active_count(), 2);

        sleep(Duration::from_millis(1500)).await;
        assert_eq!(drain(&mut rx), vec![stopped("a")]);
        assert!(debouncer.is_typing("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_and_drop_silence_timers() {
        let (debouncer, mut rx) = TypingDebouncer::new(QUIET);
        debouncer.notify_typing("a");
        debouncer.notify_typing("b");

        debouncer.cancel_all();
        assert_eq!(debouncer.active_count(), 0);

        debouncer.notify_typing("c");
        drop(debouncer);

        sleep(Duration::from_secs(5)).await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Disconnected) | Err(TryRecvError::Empty)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_typing_expires() {
        let mut remote = RemoteTyping::new(QUIET);
        let start = Instant::now();

        assert!(remote.mark_typing("room-7", Some("farmer-1".into()), start));
        assert!(!remote.mark_typing("room-7", Some("farmer-1".into()), start + Duration::from_secs(1)));
        assert_eq!(remote.typist("room-7", start + Duration::from_secs(2)), Some("farmer-1"));

        assert!(remote.is_typing("room-7", start + Duration::from_millis(3900)));
        assert!(!remote.is_typing("room-7", start + Duration::from_secs(4)));
        assert!(remote.active_rooms(start + Duration::from_secs(5)).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_stop_before_typing_is_noop() {
        let mut remote = RemoteTyping::new(QUIET);
        let now = Instant::now();
        assert!(!remote.mark_stopped("room-7", now));

        remote.mark_typing("room-7", None, now);
        assert!(remote.mark_stopped("room-7", now));
        assert!(!remote.mark_stopped("room-7", now));
        assert!(!remote.is_typing("room-7", now));
    }
}
