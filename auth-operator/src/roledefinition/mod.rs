pub mod reconcile;
pub mod rules;

pub use reconcile::run;
