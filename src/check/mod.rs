mod health;

pub use health::HealthCheck;
