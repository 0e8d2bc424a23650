//! Decoded control events between clients and the driver.
//!
//! The wire codecs for these messages belong to the client library; the
//! driver core consumes and produces the decoded forms below.

use crate::error::ErrorCode;

pub const NULL_VALUE: i64 = -1;

/// Commands the conductor accepts from clients.
#[derive(Clone, Debug)]
pub enum ClientCommand {
    AddPublication {
        client_id: i64,
        correlation_id: i64,
        stream_id: i32,
        channel: String,
        is_exclusive: bool,
    },
    RemovePublication {
        client_id: i64,
        correlation_id: i64,
        registration_id: i64,
    },
    AddSubscription {
        client_id: i64,
        correlation_id: i64,
        stream_id: i32,
        channel: String,
    },
    RemoveSubscription {
        client_id: i64,
        correlation_id: i64,
        registration_id: i64,
    },
    AddCounter {
        client_id: i64,
        correlation_id: i64,
        type_id: i32,
        key: Vec<u8>,
        label: String,
    },
    AddStaticCounter {
        client_id: i64,
        correlation_id: i64,
        type_id: i32,
        key: Vec<u8>,
        label: String,
        registration_id: i64,
    },
    RemoveCounter {
        client_id: i64,
        correlation_id: i64,
        counter_id: i32,
    },
    ClientKeepalive {
        client_id: i64,
    },
    ClientClose {
        client_id: i64,
    },
    RejectImage {
        client_id: i64,
        correlation_id: i64,
        image_correlation_id: i64,
        position: i64,
        reason: String,
    },
    AddDestination {
        client_id: i64,
        correlation_id: i64,
        registration_id: i64,
        channel: String,
    },
    RemoveDestination {
        client_id: i64,
        correlation_id: i64,
        registration_id: i64,
        channel: String,
    },
    TerminateDriver {
        client_id: i64,
    },
}

/// Events the conductor emits back to clients.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientEvent {
    PublicationReady {
        correlation_id: i64,
        registration_id: i64,
        stream_id: i32,
        session_id: i32,
        position_limit_counter_id: i32,
        log_file: String,
        is_exclusive: bool,
    },
    SubscriptionReady {
        correlation_id: i64,
        registration_id: i64,
    },
    AvailableImage {
        correlation_id: i64,
        subscription_registration_id: i64,
        session_id: i32,
        stream_id: i32,
        join_position: i64,
        log_file: String,
        source_identity: String,
    },
    UnavailableImage {
        correlation_id: i64,
        subscription_registration_id: i64,
        stream_id: i32,
    },
    CounterReady {
        correlation_id: i64,
        counter_id: i32,
    },
    UnavailableCounter {
        registration_id: i64,
        counter_id: i32,
    },
    OperationSuccess {
        correlation_id: i64,
    },
    Error {
        correlation_id: i64,
        code: ErrorCode,
        message: String,
    },
    ClientTimeout {
        client_id: i64,
    },
    PublicationError {
        registration_id: i64,
        session_id: i32,
        stream_id: i32,
        code: ErrorCode,
        message: String,
    },
}

/// Notifications raised by publications and images during their time events,
/// translated into client events by the conductor.
#[derive(Clone, Debug, PartialEq)]
pub enum Notification {
    AvailableImage {
        correlation_id: i64,
        subscription_registration_id: i64,
        session_id: i32,
        stream_id: i32,
        join_position: i64,
        log_file: String,
        source_identity: String,
    },
    UnavailableImage {
        correlation_id: i64,
        subscription_registration_id: i64,
        stream_id: i32,
    },
    PublicationError {
        registration_id: i64,
        session_id: i32,
        stream_id: i32,
        code: ErrorCode,
        message: String,
    },
}

impl From<Notification> for ClientEvent {
    fn from(notification: Notification) -> Self {
        match notification {
            Notification::AvailableImage {
                correlation_id,
                subscription_registration_id,
                session_id,
                stream_id,
                join_position,
                log_file,
                source_identity,
            } => ClientEvent::AvailableImage {
                correlation_id,
                subscription_registration_id,
                session_id,
                stream_id,
                join_position,
                log_file,
                source_identity,
            },
            Notification::UnavailableImage {
                correlation_id,
                subscription_registration_id,
                stream_id,
            } => ClientEvent::UnavailableImage {
                correlation_id,
                subscription_registration_id,
                stream_id,
            },
            Notification::PublicationError {
                registration_id,
                session_id,
                stream_id,
                code,
                message,
            } => ClientEvent::PublicationError {
                registration_id,
                session_id,
                stream_id,
                code,
                message,
            },
        }
    }
}
