pub mod assistant;
pub mod clock;
pub mod persona;
pub mod prompt;
pub mod services;
pub mod session;
pub mod traits;
