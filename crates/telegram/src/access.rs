use parrot_accounts::types::OwnerId;

/// Decide whether an inbound control-bot message may be processed.
///
/// Returns the operator's owner id if the message is allowed, or
/// `Err(reason)` if it should be dropped without a reply.
pub fn check_access(
    whitelist: &[i64],
    is_private: bool,
    sender_id: Option<i64>,
) -> Result<OwnerId, AccessDenied> {
    if !is_private {
        return Err(AccessDenied::NotPrivate);
    }
    let sender = sender_id.ok_or(AccessDenied::NoSender)?;
    // An empty whitelist denies everyone.
    if whitelist.contains(&sender) {
        Ok(OwnerId(sender))
    } else {
        Err(AccessDenied::NotOnWhitelist)
    }
}

/// Reason an inbound message was denied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDenied {
    NotPrivate,
    NoSender,
    NotOnWhitelist,
}

impl std::fmt::Display for AccessDenied {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotPrivate => write!(f, "not a private chat"),
            Self::NoSender => write!(f, "message has no sender"),
            Self::NotOnWhitelist => write!(f, "user not on whitelist"),
        }
    }
}
