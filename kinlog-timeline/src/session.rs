//! In-memory timeline passwords for one logged-in session.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

use kinlog_crypto::{unwrap_credential, CryptoProvider, Opened};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::error::{TimelineError, TimelineResult};
use crate::identity::{ChildId, TimelineId};
use crate::roster::ChildProfile;

/// A child whose password could not be recovered at login.
#[derive(Debug)]
pub struct CredentialFailure {
    pub child: ChildId,
    pub error: TimelineError,
}

/// Owned map of timeline passwords.
///
/// Passwords never leave this type except as borrows for a single call, are
/// zeroized on [`clear`](Self::clear) and on drop, and are never persisted.
pub struct SessionPasswords {
    general: Option<Zeroizing<String>>,
    children: BTreeMap<ChildId, Zeroizing<String>>,
    idle_timeout: Duration,
    last_activity: Instant,
}

impl SessionPasswords {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            general: None,
            children: BTreeMap::new(),
            idle_timeout,
            last_activity: Instant::now(),
        }
    }

    /// Starts a parent session: clears whatever was held, stores the parent
    /// password and recovers every child password from its credential record.
    ///
    /// Children whose records fail to open are returned as failures and left
    /// out of the map. If there are children and not one record opens, the
    /// parent password is unverified and the session is left empty, whether
    /// the records rejected it or were too damaged to try.
    pub fn login_parent(
        &mut self,
        provider: &dyn CryptoProvider,
        parent_password: &str,
        roster: &[ChildProfile],
    ) -> TimelineResult<Vec<CredentialFailure>> {
        if parent_password.is_empty() {
            return Err(TimelineError::EmptyPassword);
        }
        self.clear();

        let mut recovered = BTreeMap::new();
        let mut failures = Vec::new();
        for child in roster {
            match unwrap_credential(provider, &child.credential, parent_password) {
                Ok(Opened::Plaintext(password)) => {
                    recovered.insert(child.id, password);
                }
                Ok(Opened::WrongKey) => {
                    failures.push(CredentialFailure {
                        child: child.id,
                        error: TimelineError::ParentPasswordMismatch,
                    });
                }
                Err(e) => {
                    warn!(child = %child.id, error = %e, "Credential record could not be opened");
                    failures.push(CredentialFailure {
                        child: child.id,
                        error: e.into(),
                    });
                }
            }
        }

        if !roster.is_empty() && recovered.is_empty() {
            warn!(failed = failures.len(), "No credential record opened for parent login");
            return Err(TimelineError::ParentPasswordMismatch);
        }

        self.general = Some(Zeroizing::new(parent_password.to_owned()));
        self.children = recovered;
        self.touch();
        info!(
            children = self.children.len(),
            failed = failures.len(),
            "Parent session started"
        );
        Ok(failures)
    }

    pub fn insert(&mut self, timeline: TimelineId, password: &str) {
        let password = Zeroizing::new(password.to_owned());
        match timeline {
            TimelineId::General => self.general = Some(password),
            TimelineId::Child(id) => {
                self.children.insert(id, password);
            }
        }
        self.touch();
    }

    pub fn password_for(&self, timeline: &TimelineId) -> Option<&str> {
        match timeline {
            TimelineId::General => self.general.as_deref().map(String::as_str),
            TimelineId::Child(id) => self.children.get(id).map(|p| p.as_str()),
        }
    }

    pub fn remove(&mut self, timeline: &TimelineId) -> bool {
        match timeline {
            TimelineId::General => self.general.take().is_some(),
            TimelineId::Child(id) => self.children.remove(id).is_some(),
        }
    }

    /// Timelines that currently have a password, General first.
    pub fn timelines(&self) -> Vec<TimelineId> {
        self.general
            .iter()
            .map(|_| TimelineId::General)
            .chain(self.children.keys().map(|id| TimelineId::Child(*id)))
            .collect()
    }

    pub fn len(&self) -> usize {
        usize::from(self.general.is_some()) + self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every password. Each one is zeroized as it is dropped.
    pub fn clear(&mut self) {
        let had = self.len();
        self.general = None;
        self.children.clear();
        if had > 0 {
            debug!(cleared = had, "Session passwords cleared");
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn is_idle(&self) -> bool {
        self.last_activity.elapsed() >= self.idle_timeout
    }

    /// Clears the session if it has been idle past its timeout.
    pub fn expire_if_idle(&mut self) -> bool {
        if self.is_idle() && !self.is_empty() {
            info!("Session idle timeout reached");
            self.clear();
            return true;
        }
        false
    }
}

impl Drop for SessionPasswords {
    fn drop(&mut self) {
        self.clear();
    }
}

impl fmt::Debug for SessionPasswords {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionPasswords")
            .field("general", &self.general.is_some())
            .field("children", &self.children.len())
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}
