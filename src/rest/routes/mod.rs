pub mod assets;
pub mod dashboard;
pub mod health;
pub mod manifest;
pub mod publish;
