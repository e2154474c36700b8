pub mod namespaces;
pub mod reconcile;
pub mod roleref;
pub mod serviceaccount;

pub use reconcile::run;
