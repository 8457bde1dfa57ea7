use std::ops::{Deref, DerefMut};

use tracing::debug;

use crate::component::Identity;
use crate::executor::Staging;

/// Scoped elevation to root.
///
/// Restores the identity the staging had before [`PrivilegeGuard::elevate`]
/// when dropped, so an error inside the block cannot leave the stage
/// running as root.
pub struct PrivilegeGuard<'a> {
    staging: &'a mut Staging,
    restore: Identity,
}

impl<'a> PrivilegeGuard<'a> {
    pub fn elevate(staging: &'a mut Staging, reason: &str) -> Self {
        let restore = std::mem::replace(&mut staging.identity, Identity::Root);
        debug!(reason, from = %restore, "elevating");
        staging.layers.push(format!("user root ({reason})"));
        Self { staging, restore }
    }
}

impl Deref for PrivilegeGuard<'_> {
    type Target = Staging;

    fn deref(&self) -> &Staging {
        self.staging
    }
}

impl DerefMut for PrivilegeGuard<'_> {
    fn deref_mut(&mut self) -> &mut Staging {
        self.staging
    }
}

impl Drop for PrivilegeGuard<'_> {
    fn drop(&mut self) {
        self.staging.identity = self.restore.clone();
        self.staging
            .layers
            .push(format!("user {}", self.restore));
        debug!(to = %self.restore, "privileges dropped");
    }
}
