use crate::error::AppError;
use crate::models::{Conversation, CurrentUser};
use uuid::Uuid;

/// Single place where roles turn into read permissions
///
/// Writes (sending, marking read, archiving) always require the caller to be
/// the acting participant and are checked by the services themselves; the
/// policy only widens *read* access, e.g. for moderators.
pub trait AccessPolicy: Send + Sync {
    fn can_view_conversation(&self, user: &CurrentUser, conversation: &Conversation) -> bool;

    /// Whether `user` may read data owned by `subject` (unread counts, quota)
    fn can_act_for(&self, user: &CurrentUser, subject: Uuid) -> bool;

    fn require_view(&self, user: &CurrentUser, conversation: &Conversation) -> Result<(), AppError> {
        if self.can_view_conversation(user, conversation) {
            Ok(())
        } else {
            Err(AppError::NotParticipant)
        }
    }

    fn require_act_for(&self, user: &CurrentUser, subject: Uuid) -> Result<(), AppError> {
        if self.can_act_for(user, subject) {
            Ok(())
        } else {
            Err(AppError::Forbidden)
        }
    }
}

/// Members see their own data; admins see everything
#[derive(Debug, Default, Clone, Copy)]
pub struct RoleAccessPolicy;

impl AccessPolicy for RoleAccessPolicy {
    fn can_view_conversation(&self, user: &CurrentUser, conversation: &Conversation) -> bool {
        conversation.is_participant(user.id) || user.role.is_privileged()
    }

    fn can_act_for(&self, user: &CurrentUser, subject: Uuid) -> bool {
        user.id == subject || user.role.is_privileged()
    }
}
