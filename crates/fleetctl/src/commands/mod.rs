pub mod entities;
pub mod plan;
pub mod state;
