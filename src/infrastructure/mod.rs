pub mod database;
pub mod entities;
pub mod firestore;
pub mod gemini;
pub mod model;
pub mod repositories;
pub mod traits;
