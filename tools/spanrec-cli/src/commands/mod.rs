pub mod check;
pub mod monitors;
pub mod mux;
pub mod record;
