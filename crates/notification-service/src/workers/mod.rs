pub mod reconciler;
pub mod sweeper;

pub use reconciler::{CounterReconciler, ReconcileReport};
pub use sweeper::RegistrySweeper;
