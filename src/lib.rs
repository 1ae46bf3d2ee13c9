pub mod analyzers;
pub mod classifier;
pub mod config;
pub mod coordinator;
pub mod dns;
pub mod error;
pub mod message;
pub mod rules;
pub mod spf;

pub use classifier::{AdaptiveClassifier, Classification, ClassifierSnapshot};
pub use config::{Config, FailurePolicy};
pub use coordinator::{Coordinator, RiskLevel, SecurityReport};
pub use error::{Result, SentinelError};
pub use message::{InboundMessage, MessageContext};
pub use rules::{Rule, RuleAction, RuleEngine};
pub use spf::{SpfEvaluator, SpfResult, SpfVerification};
