//! 能力层：领域包注册表、目标领域分类、能力调用与内置核心包

pub mod classifier;
pub mod echo;
pub mod invoker;
pub mod registry;

pub use classifier::DomainClassifier;
pub use echo::core_pack;
pub use invoker::CapabilityInvoker;
pub use registry::{CapabilityDescriptor, CapabilityHandler, CapabilityRegistry, DomainPack};
