pub mod api;
pub mod asset;
pub mod bus;
pub mod config;
pub mod forecast;
pub mod memory;
pub mod service;
pub mod store;
pub mod tasks;

pub use asset::Asset;
pub use asset::AssetType;
pub use bus::AttributeEvent;
pub use bus::EventBus;
pub use bus::PersistenceCause;
pub use bus::PersistenceEvent;
pub use config::Config;
pub use config::LogLevel;
pub use forecast::ForecastError;
pub use forecast::ForecastSolarClient;
pub use service::Collaborators;
pub use service::ForecastService;
pub use tasks::TaskManager;
