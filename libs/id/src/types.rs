//! Typed ID definitions for orchestrator resources.

use crate::define_id;

// One asynchronous lifecycle operation (create, delete, bulk action, ...).
define_id!(TaskId, "task");

// A persisted operator notification.
define_id!(NotificationId, "ntf");

// Correlates an inbound HTTP request with log lines and problem responses.
define_id!(RequestId, "req");
