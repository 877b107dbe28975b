//! Role-based access decisions for protected routes.

use crate::config::RouteConfig;
use crate::types::{Role, Session};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    NotConnected,
    InsufficientRole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "decision", content = "reason")]
pub enum Access {
    Allow,
    Deny(DenyReason),
}

impl Access {
    pub fn is_allowed(self) -> bool {
        self == Self::Allow
    }
}

/// Pure authorization over the current session; never touches the network.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccessGate;

impl AccessGate {
    pub fn authorize(&self, session: Option<&Session>, required: Role) -> Access {
        if required == Role::Unauthenticated {
            return Access::Allow;
        }
        let Some(session) = session.filter(|s| s.is_connected()) else {
            return Access::Deny(DenyReason::NotConnected);
        };
        match (required, session.role()) {
            (Role::Verifier, Role::Verifier) => Access::Allow,
            (Role::Verifier, _) => Access::Deny(DenyReason::InsufficientRole),
            (Role::User, _) => Access::Allow,
            (Role::Unauthenticated, _) => Access::Allow,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "target")]
pub enum GuardState {
    Checking,
    Allowed,
    Redirect(String),
}

impl GuardState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Checking)
    }
}

/// Route guard: `Checking -> {Allowed, Redirect(target)}`.
///
/// Re-enters `Checking` on every session change and holds there while the session is
/// still settling, so protected content is never shown ahead of the decision.
#[derive(Debug, Clone)]
pub struct RouteGuard {
    required: Role,
    routes: RouteConfig,
    gate: AccessGate,
    state: GuardState,
}

impl RouteGuard {
    pub fn new(required: Role, routes: RouteConfig) -> Self {
        Self {
            required,
            routes,
            gate: AccessGate,
            state: GuardState::Checking,
        }
    }

    pub fn state(&self) -> &GuardState {
        &self.state
    }

    pub fn can_render(&self) -> bool {
        self.state == GuardState::Allowed
    }

    pub fn session_changed(&mut self) {
        self.state = GuardState::Checking;
    }

    /// Evaluate the guard against a session snapshot.
    pub fn evaluate(&mut self, session: &Session) -> &GuardState {
        self.session_changed();
        if session.is_settling() {
            debug!(required = self.required.name(), "Route guard waiting for session to settle");
            return &self.state;
        }

        self.state = match self.gate.authorize(Some(session), self.required) {
            Access::Allow => GuardState::Allowed,
            Access::Deny(DenyReason::NotConnected) => {
                GuardState::Redirect(self.routes.home.clone())
            }
            Access::Deny(DenyReason::InsufficientRole) => {
                GuardState::Redirect(self.routes.verifier_login.clone())
            }
        };
        debug!(required = self.required.name(), state = ?self.state, "Route guard resolved");
        &self.state
    }

    /// Follow session updates until the guard reaches a terminal state.
    ///
    /// If the session publisher goes away first, the guard resolves against the last value.
    pub async fn resolve(&mut self, sessions: &mut watch::Receiver<Session>) -> GuardState {
        loop {
            let snapshot = sessions.borrow_and_update().clone();
            if self.evaluate(&snapshot).is_terminal() {
                return self.state.clone();
            }
            if sessions.changed().await.is_err() {
                let snapshot = sessions.borrow().clone();
                self.evaluate(&snapshot);
                if !self.state.is_terminal() {
                    self.state = GuardState::Redirect(self.routes.home.clone());
                }
                return self.state.clone();
            }
        }
    }
}
