pub mod clock;
pub mod dispatch;
pub mod google;
pub mod handlers;
pub mod mappers;
pub mod model_family;
pub mod project_resolver;
pub mod rate_limit;
pub mod server;
pub mod session;
pub mod state;
pub mod token;
pub mod upstream;
