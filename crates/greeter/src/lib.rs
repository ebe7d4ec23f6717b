//! Hammond greeter
//!
//! A durable greeting: send a notification, wait, send a reminder. Built on
//! `hammond-durable`, so each send runs at most once per greeting even when
//! the process crashes or the greeting is retried.
//!
//! ```text
//! GreeterRunner ──► WorkflowDriver ──► GreeterWorkflow
//!       │                 │                 ├── ctx.uuid()
//!       │                 │                 ├── ctx.run("notification")
//!       │                 │                 ├── ctx.sleep(reminder_delay)
//!       │                 │                 └── ctx.run("reminder")
//!       └── wake-up loop ◄┘ (TokioWakeupScheduler)
//! ```

pub mod config;
pub mod credentials;
pub mod greeter;
pub mod notifier;
pub mod runner;
pub mod telemetry;

pub use config::{ConfigError, GreeterConfig};
pub use credentials::{CredentialError, Credentials};
pub use greeter::{GreeterWorkflow, Greeting, GreetingRequest};
pub use notifier::{Delivery, MessageKind, Notifier, SimulatedNotifier};
pub use runner::{register_greeter, GreeterRunner, GreetingResult};
pub use telemetry::{init_telemetry, TelemetryConfig};
