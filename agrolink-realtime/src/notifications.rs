//! Push notification state and native delivery.
//!
//! ```text
//! inbound `notification`
//!       │
//!       ▼
//! NotificationDispatcher::receive()
//!       │                     │
//!       ▼                     ▼  (permission granted, unread)
//! NotificationCenter     NativeNotifier::show()   tag = notification id
//! (list + unread count)       │
//!                             ▼  (priority low)
//!                        dismiss after delay, silent
//! ```
//!
//! The unread counter is kept separately from the list so the server can
//! overwrite it (`set_unread_count`); it never goes below zero.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::config::NotificationConfig;
use crate::error::NotifierError;
use crate::protocol::Notification;

// ───────────────────────────────────────────────────────────────────
// In-app state
// ───────────────────────────────────────────────────────────────────

/// Whether [`NotificationCenter::upsert`] added or replaced an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Updated,
}

/// In-app notification list (newest first) and unread counter.
#[derive(Debug, Default, Clone)]
pub struct NotificationCenter {
    items: VecDeque<Notification>,
    unread: u64,
}

impl NotificationCenter {
    /// Create an empty center.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new notification or apply a redelivery as an update.
    pub fn upsert(&mut self, notification: Notification) -> Upsert {
        if self.position(&notification.id).is_some() {
            self.apply_update(notification);
            return Upsert::Updated;
        }
        if !notification.read {
            self.unread += 1;
        }
        self.items.push_front(notification);
        Upsert::Inserted
    }

    /// Replace a notification, adjusting the counter on read-flag changes.
    ///
    /// Unknown ids are inserted.
    pub fn apply_update(&mut self, notification: Notification) {
        let Some(index) = self.position(&notification.id) else {
            self.upsert(notification);
            return;
        };
        let was_read = self.items[index].read;
        self.adjust_unread(was_read, notification.read);
        self.items[index] = notification;
    }

    /// Mark one notification read. Returns `false` if unknown or already read.
    pub fn mark_as_read(&mut self, id: &str) -> bool {
        match self.items.iter_mut().find(|n| n.id == id) {
            Some(n) if !n.read => {
                n.read = true;
                self.unread = self.unread.saturating_sub(1);
                true
            }
            _ => false,
        }
    }

    /// Mark everything read; the counter is zeroed unconditionally.
    pub fn mark_all_read(&mut self) {
        for n in self.items.iter_mut() {
            n.read = true;
        }
        self.unread = 0;
    }

    /// Overwrite the counter (server-provided); negatives clamp to zero.
    pub fn set_unread_count(&mut self, count: i64) {
        self.unread = count.max(0) as u64;
    }

    /// Explicitly delete one notification.
    pub fn remove(&mut self, id: &str) -> Option<Notification> {
        let index = self.position(id)?;
        let removed = self.items.remove(index)?;
        if !removed.read {
            self.unread = self.unread.saturating_sub(1);
        }
        Some(removed)
    }

    /// Explicitly delete everything.
    pub fn clear(&mut self) {
        self.items.clear();
        self.unread = 0;
    }

    /// Replace the list (e.g. after a REST refresh) and recount unread.
    pub fn replace_all(&mut self, notifications: Vec<Notification>) {
        self.unread = notifications.iter().filter(|n| !n.read).count() as u64;
        self.items = notifications.into();
    }

    /// Look up one notification by id.
    pub fn get(&self, id: &str) -> Option<&Notification> {
        self.items.iter().find(|n| n.id == id)
    }

    /// Newest first.
    pub fn list(&self) -> impl Iterator<Item = &Notification> {
        self.items.iter()
    }

    /// Get the current unread count.
    pub fn unread_count(&self) -> u64 {
        self.unread
    }

    /// Number of notifications held, read or not.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.items.iter().position(|n| n.id == id)
    }

    fn adjust_unread(&mut self, was_read: bool, now_read: bool) {
        match (was_read, now_read) {
            (false, true) => self.unread = self.unread.saturating_sub(1),
            (true, false) => self.unread += 1,
            _ => {}
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Native surface
// ───────────────────────────────────────────────────────────────────

/// OS notification permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    /// Not asked yet.
    Undecided,
    Granted,
    Denied,
}

/// What gets handed to the OS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeToast {
    /// Deduplication tag: a toast with the same tag replaces the previous one.
    pub tag: String,
    pub title: String,
    pub body: String,
    pub icon: Option<String>,
    /// No sound or vibration.
    pub silent: bool,
    /// Stays until the user dismisses it.
    pub require_interaction: bool,
    pub url: Option<String>,
}

impl NativeToast {
    pub fn from_notification(notification: &Notification, icon: Option<String>) -> Self {
        let low = notification.priority.is_low();
        Self {
            tag: notification.id.clone(),
            title: notification.title.clone(),
            body: notification.message.clone(),
            icon,
            silent: low,
            require_interaction: !low,
            url: notification.url.clone(),
        }
    }
}

/// The operating system's notification surface.
pub trait NativeNotifier: Send + Sync + 'static {
    fn permission(&self) -> Permission;

    /// Ask the user once. Returns the resulting permission.
    fn request_permission(&self) -> Permission;

    fn show(&self, toast: &NativeToast) -> Result<(), NotifierError>;

    /// Remove the toast with `tag`, if still shown.
    fn dismiss(&self, tag: &str);
}

/// Notifier for environments without a desktop: logs toasts.
///
/// Requesting permission grants it.
#[derive(Debug)]
pub struct HeadlessNotifier {
    permission: Mutex<Permission>,
}

impl HeadlessNotifier {
    /// Create a notifier with a fixed starting permission.
    pub fn new(permission: Permission) -> Self {
        Self {
            permission: Mutex::new(permission),
        }
    }
}

impl Default for HeadlessNotifier {
    fn default() -> Self {
        Self::new(Permission::Undecided)
    }
}

impl NativeNotifier for HeadlessNotifier {
    fn permission(&self) -> Permission {
        *self.permission.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn request_permission(&self) -> Permission {
        let mut permission = self.permission.lock().unwrap_or_else(PoisonError::into_inner);
        if *permission == Permission::Undecided {
            *permission = Permission::Granted;
        }
        *permission
    }

    fn show(&self, toast: &NativeToast) -> Result<(), NotifierError> {
        if self.permission() != Permission::Granted {
            return Err(NotifierError::PermissionDenied);
        }
        log::info!(
            "Notification [{}] {}: {}{}",
            toast.tag,
            toast.title,
            toast.body,
            if toast.silent { " (silent)" } else { "" }
        );
        Ok(())
    }

    fn dismiss(&self, tag: &str) {
        log::debug!("Notification [{tag}] dismissed");
    }
}

// ───────────────────────────────────────────────────────────────────
// Dispatcher
// ───────────────────────────────────────────────────────────────────

/// What happened on the native side for one notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeOutcome {
    /// Shown; low priority toasts carry their auto-dismiss delay.
    Shown { auto_dismiss: Option<Duration> },
    /// Already read on arrival; no toast.
    Skipped,
    /// In-app only.
    PermissionNotGranted,
    /// The surface failed; in-app only.
    Failed(NotifierError),
}

/// Result of [`NotificationDispatcher::receive`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub upsert: Upsert,
    pub native: NativeOutcome,
}

#[derive(Default)]
struct DismissTimers {
    next_generation: u64,
    active: HashMap<String, (u64, JoinHandle<()>)>,
}

fn lock(timers: &Mutex<DismissTimers>) -> MutexGuard<'_, DismissTimers> {
    timers.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Routes inbound notifications to in-app state and the native surface.
pub struct NotificationDispatcher {
    config: NotificationConfig,
    center: RwLock<NotificationCenter>,
    notifier: Arc<dyn NativeNotifier>,
    dismiss_timers: Arc<Mutex<DismissTimers>>,
}

impl NotificationDispatcher {
    /// Create a dispatcher delivering through `notifier`.
    pub fn new(config: NotificationConfig, notifier: Arc<dyn NativeNotifier>) -> Self {
        Self {
            config,
            center: RwLock::new(NotificationCenter::new()),
            notifier,
            dismiss_timers: Arc::new(Mutex::new(DismissTimers::default())),
        }
    }

    /// Request native permission if the user has not been asked yet.
    pub fn ensure_permission(&self) -> Permission {
        match self.notifier.permission() {
            Permission::Undecided => {
                let permission = self.notifier.request_permission();
                log::info!("Notification permission: {permission:?}");
                permission
            }
            permission => permission,
        }
    }

    /// Handle an inbound `notification`.
    pub async fn receive(&self, notification: Notification) -> Delivery {
        let upsert = self.center.write().await.upsert(notification.clone());
        let native = self.show_native(&notification);
        Delivery { upsert, native }
    }

    fn show_native(&self, notification: &Notification) -> NativeOutcome {
        if notification.read {
            return NativeOutcome::Skipped;
        }
        if self.notifier.permission() != Permission::Granted {
            log::debug!("Notification {} shown in-app only (no permission)", notification.id);
            return NativeOutcome::PermissionNotGranted;
        }

        let toast = NativeToast::from_notification(notification, self.config.icon.clone());
        if let Err(e) = self.notifier.show(&toast) {
            log::warn!("Native notification {} failed: {e}", notification.id);
            return NativeOutcome::Failed(e);
        }

        if notification.priority.is_low() {
            let delay = self.config.low_priority_dismiss;
            self.schedule_dismiss(toast.tag, delay);
            NativeOutcome::Shown { auto_dismiss: Some(delay) }
        } else {
            // A redelivered notification may have been low before.
            self.cancel_dismiss(&toast.tag);
            NativeOutcome::Shown { auto_dismiss: None }
        }
    }

    fn schedule_dismiss(&self, tag: String, delay: Duration) {
        let mut timers = lock(&self.dismiss_timers);
        timers.next_generation += 1;
        let generation = timers.next_generation;

        let notifier = Arc::clone(&self.notifier);
        let registry = Arc::clone(&self.dismiss_timers);
        let timer_tag = tag.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut timers = lock(&registry);
            if timers.active.get(&timer_tag).is_some_and(|(g, _)| *g == generation) {
                timers.active.remove(&timer_tag);
                drop(timers);
                notifier.dismiss(&timer_tag);
            }
        });

        if let Some((_, previous)) = timers.active.insert(tag, (generation, handle)) {
            previous.abort();
        }
    }

    fn cancel_dismiss(&self, tag: &str) {
        if let Some((_, handle)) = lock(&self.dismiss_timers).active.remove(tag) {
            handle.abort();
        }
    }

    /// The user clicked the native toast: mark read, dismiss, and return
    /// the URL to navigate to.
    pub async fn handle_click(&self, id: &str) -> Option<String> {
        let url = {
            let mut center = self.center.write().await;
            center.mark_as_read(id);
            center.get(id).and_then(|n| n.url.clone())
        };
        self.cancel_dismiss(id);
        self.notifier.dismiss(id);
        url
    }

    /// Mark one notification read. Returns `true` if it was unread.
    pub async fn mark_as_read(&self, id: &str) -> bool {
        self.center.write().await.mark_as_read(id)
    }

    /// Mark everything read and zero the counter.
    pub async fn mark_all_read(&self) {
        self.center.write().await.mark_all_read();
    }

    /// Handle an inbound `notification:update`.
    pub async fn apply_update(&self, notification: Notification) {
        self.center.write().await.apply_update(notification);
    }

    /// Overwrite the unread counter (server value). Negatives clamp to 0.
    pub async fn set_unread_count(&self, count: i64) {
        self.center.write().await.set_unread_count(count);
    }

    /// Delete one notification and its pending dismissal.
    pub async fn remove(&self, id: &str) -> Option<Notification> {
        self.cancel_dismiss(id);
        self.center.write().await.remove(id)
    }

    /// Delete everything and dismiss toasts still on screen.
    pub async fn clear(&self) {
        let tags: Vec<String> = {
            let mut timers = lock(&self.dismiss_timers);
            timers
                .active
                .drain()
                .map(|(tag, (_, handle))| {
                    handle.abort();
                    tag
                })
                .collect()
        };
        for tag in tags {
            self.notifier.dismiss(&tag);
        }
        self.center.write().await.clear();
    }

    /// Replace the list with a fresh server snapshot.
    pub async fn replace_all(&self, notifications: Vec<Notification>) {
        self.center.write().await.replace_all(notifications);
    }

    /// Get the current unread count.
    pub async fn unread_count(&self) -> u64 {
        self.center.read().await.unread_count()
    }

    /// Look up one notification by id.
    pub async fn get(&self, id: &str) -> Option<Notification> {
        self.center.read().await.get(id).cloned()
    }

    /// Snapshot of the list, newest first.
    pub async fn notifications(&self) -> Vec<Notification> {
        self.center.read().await.list().cloned().collect()
    }

    /// Number of low-priority toasts waiting to be auto-dismissed.
    pub fn pending_dismissals(&self) -> usize {
        lock(&self.dismiss_timers).active.len()
    }
}

impl Drop for NotificationDispatcher {
    fn drop(&mut self) {
        for (_, (_, handle)) in lock(&self.dismiss_timers).active.drain() {
            handle.abort();
        }
    }
}
