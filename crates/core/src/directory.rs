use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

/// Membership and reporting-line lookups consumed from the surrounding
/// system. Implementations should return empty sets when a lookup fails; the
/// engine flags unresolvable steps instead of guessing approvers.
pub trait DirectoryService: Send + Sync {
    /// Active users holding the role.
    fn users_with_role(&self, role_name: &str) -> Vec<String>;
    /// Active members of the group.
    fn group_members(&self, group_name: &str) -> Vec<String>;
    /// Managers of the department.
    fn department_managers(&self, department: &str) -> Vec<String>;
    /// Direct manager of the user, when known.
    fn manager_of(&self, user_id: &str) -> Option<String>;
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryDirectory {
    roles: HashMap<String, BTreeSet<String>>,
    groups: HashMap<String, BTreeSet<String>>,
    departments: HashMap<String, BTreeSet<String>>,
    managers: HashMap<String, String>,
}

impl InMemoryDirectory {
    pub fn with_role(mut self, role_name: &str, members: &[&str]) -> Self {
        self.roles
            .entry(role_name.to_string())
            .or_default()
            .extend(members.iter().map(|member| member.to_string()));
        self
    }

    pub fn with_group(mut self, group_name: &str, members: &[&str]) -> Self {
        self.groups
            .entry(group_name.to_string())
            .or_default()
            .extend(members.iter().map(|member| member.to_string()));
        self
    }

    pub fn with_department_managers(mut self, department: &str, managers: &[&str]) -> Self {
        self.departments
            .entry(department.to_string())
            .or_default()
            .extend(managers.iter().map(|manager| manager.to_string()));
        self
    }

    pub fn with_manager(mut self, user_id: &str, manager_id: &str) -> Self {
        self.managers.insert(user_id.to_string(), manager_id.to_string());
        self
    }
}

impl DirectoryService for InMemoryDirectory {
    fn users_with_role(&self, role_name: &str) -> Vec<String> {
        self.roles.get(role_name).map(|members| members.iter().cloned().collect()).unwrap_or_default()
    }

    fn group_members(&self, group_name: &str) -> Vec<String> {
        self.groups
            .get(group_name)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn department_managers(&self, department: &str) -> Vec<String> {
        self.departments
            .get(department)
            .map(|managers| managers.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn manager_of(&self, user_id: &str) -> Option<String> {
        self.managers.get(user_id).cloned()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    ApprovalRequested,
    ReminderDue,
    StepEscalated,
    RequestResolved,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub request_id: String,
    pub recipients: Vec<String>,
    pub message: String,
}

/// Fire-and-forget delivery seam. Failures inside an implementation must
/// never propagate back into the state machine.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification);
}

#[derive(Clone, Default)]
pub struct InMemoryNotificationSink {
    notifications: Arc<Mutex<Vec<Notification>>>,
}

impl InMemoryNotificationSink {
    pub fn notifications(&self) -> Vec<Notification> {
        match self.notifications.lock() {
            Ok(notifications) => notifications.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn count_of(&self, kind: NotificationKind) -> usize {
        self.notifications().iter().filter(|notification| notification.kind == kind).count()
    }
}

impl NotificationSink for InMemoryNotificationSink {
    fn notify(&self, notification: Notification) {
        match self.notifications.lock() {
            Ok(mut notifications) => notifications.push(notification),
            Err(poisoned) => poisoned.into_inner().push(notification),
        }
    }
}

/// Sink for hosts that do not deliver notifications.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullNotificationSink;

impl NotificationSink for NullNotificationSink {
    fn notify(&self, _notification: Notification) {}
}
