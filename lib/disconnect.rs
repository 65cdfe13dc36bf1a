//! Unmounting the filesystem when the device goes away.
//!
//! Once the device is gone every operation would fail, and some programs retry forever. Unmounting
//! is the only useful reaction, and it must happen exactly once no matter how many operations
//! notice the disconnect at the same time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use tracing::{debug, info};

use crate::device::DisconnectCallback;

/// Something that can be unmounted.
pub trait Unmount: Send + Sync + 'static {
    /// Unmount. May block.
    fn unmount(&self);
}

/// Turns device-loss notifications into a single unmount.
///
/// Create it before the device client, hand the client [`callback`](Self::callback), and
/// [`attach`](Self::attach) the mount once it exists.
#[derive(Default)]
pub struct DisconnectHandler {
    unmounted: AtomicBool,
    target: OnceLock<Box<dyn Unmount>>,
}

impl DisconnectHandler {
    /// Create a handler with nothing attached.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Set the mount to unmount.
    ///
    /// # Panics
    ///
    /// Panics if a target is already attached.
    pub fn attach(&self, target: impl Unmount) {
        assert!(
            self.target.set(Box::new(target)).is_ok(),
            "unmount target is already attached"
        );
    }

    /// Whether [`unmount`](Self::unmount) has run.
    #[must_use]
    pub fn is_unmounted(&self) -> bool {
        self.unmounted.load(Ordering::Acquire)
    }

    /// Unmount the attached target, unless that already happened.
    ///
    /// # Panics
    ///
    /// Panics if no target is attached.
    pub fn unmount(&self) {
        let Some(target) = self.target.get() else {
            panic!("unmount requested before the filesystem was mounted");
        };

        if self
            .unmounted
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("already unmounted");
            return;
        }

        info!("unmounting...");
        target.unmount();
        info!("unmounted.");
    }

    /// React to the device disconnecting by unmounting on the blocking pool.
    ///
    /// # Panics
    ///
    /// Panics if no target is attached.
    pub fn device_disconnected(self: &Arc<Self>, runtime: &tokio::runtime::Handle) {
        assert!(
            self.target.get().is_some(),
            "device disconnected before the filesystem was mounted"
        );
        if self.is_unmounted() {
            return;
        }
        info!("device disconnected, scheduling unmount");
        let this = Arc::clone(self);
        runtime.spawn_blocking(move || this.unmount());
    }

    /// A disconnect callback for a device client.
    #[must_use]
    pub fn callback(self: &Arc<Self>, runtime: tokio::runtime::Handle) -> DisconnectCallback {
        let this = Arc::clone(self);
        Arc::new(move || this.device_disconnected(&runtime))
    }
}
