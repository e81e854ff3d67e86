pub mod presence;
pub mod ws;
