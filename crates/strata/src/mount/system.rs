//! Tag-ordered execution of a mount point set.

use strata_common::StrataResult;

use super::{MountPoint, MountTag, Points};

/// Callback run once after every point of its tag has been mounted.
pub type Hook<C> = Box<dyn FnOnce(&mut C, &mut Points) -> StrataResult<()>>;

/// Executes a single mount point.
///
/// Implementations decide whether a failure is skippable; an `Err` aborts
/// [`MountSystem::mount_all`].
pub trait MountHandler {
    /// Mount one point.
    fn mount(&mut self, point: &MountPoint) -> StrataResult<()>;
}

/// Mount point set plus its run-after-tag hooks.
pub struct MountSystem<C> {
    /// The points to mount.
    pub points: Points,
    hooks: Vec<(MountTag, Hook<C>)>,
}

impl<C> Default for MountSystem<C> {
    fn default() -> Self {
        Self {
            points: Points::new(),
            hooks: Vec::new(),
        }
    }
}

impl<C> std::fmt::Debug for MountSystem<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountSystem")
            .field("points", &self.points)
            .field(
                "hooks",
                &self.hooks.iter().map(|(tag, _)| *tag).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl<C: MountHandler> MountSystem<C> {
    /// Create an empty mount system.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook to run once `tag` has been fully mounted.
    pub fn run_after_tag(
        &mut self,
        tag: MountTag,
        hook: impl FnOnce(&mut C, &mut Points) -> StrataResult<()> + 'static,
    ) {
        self.hooks.push((tag, Box::new(hook)));
    }

    /// Number of hooks not yet run.
    #[must_use]
    pub fn pending_hooks(&self) -> usize {
        self.hooks.len()
    }

    /// Mount every point in tag order.
    ///
    /// Points are looked up by index within a tag so that entries appended
    /// by a hook of an earlier tag are still picked up.
    pub fn mount_all(&mut self, handler: &mut C) -> StrataResult<()> {
        for tag in MountTag::ALL {
            let mut index = 0;
            while let Some(point) = self.points.nth_by_tag(tag, index).cloned() {
                tracing::debug!(
                    tag = %tag,
                    source = %point.source.display(),
                    destination = %point.destination.display(),
                    "Mounting"
                );
                handler.mount(&point)?;
                index += 1;
            }

            let (ready, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.hooks)
                .into_iter()
                .partition(|(hook_tag, _)| *hook_tag == tag);
            self.hooks = pending;
            for (_, hook) in ready {
                hook(handler, &mut self.points)?;
            }
        }
        Ok(())
    }
}
