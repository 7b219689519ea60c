pub mod client;
pub mod faulty;

pub use client::{TestClient, init_tracing};
pub use faulty::FaultyStore;
