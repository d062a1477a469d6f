//! Outbound collaborator clients: eSIM provisioning, the billing ledger,
//! and the transactional-mail relay. Each sits behind a trait so the
//! orchestrator and reporter can be exercised against fakes.

pub mod billing;
pub mod notify;
pub mod provisioner;
