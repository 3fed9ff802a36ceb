//! Which users an authenticated caller may see or remove.
//!
//! Level 1 sees everyone and may delete anyone but itself. Level 2 sees
//! everyone. Level 3 sees only its own record.

use crate::store::UserSummary;
use facegate_core::UserProfile;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AccessError {
    #[error("authentication not granted ({0})")]
    NotAuthenticated(String),
    #[error("access level {0} may not delete users")]
    DeleteNotPermitted(u8),
    #[error("users may not delete themselves")]
    SelfDeletion,
}

/// The part of the user list `actor` is allowed to see.
pub fn visible_users(actor: &UserProfile, users: Vec<UserSummary>) -> Vec<UserSummary> {
    if actor.access_level.can_list_all() {
        users
    } else {
        users.into_iter().filter(|u| u.id == actor.id).collect()
    }
}

/// Whether `actor` may delete the user with id `target`.
pub fn check_delete(actor: &UserProfile, target: i64) -> Result<(), AccessError> {
    if !actor.access_level.can_delete_users() {
        return Err(AccessError::DeleteNotPermitted(actor.access_level.into()));
    }
    if actor.id == target {
        return Err(AccessError::SelfDeletion);
    }
    Ok(())
}
