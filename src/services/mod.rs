pub mod coordinator;

pub use coordinator::EscrowCoordinator;
