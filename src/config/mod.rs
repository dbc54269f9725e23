mod settings;

pub use settings::{
    BusConfig, CheckpointConfig, ConvoyConfig, IterationConfig, PersistenceConfig, SchedulerConfig,
    StoreBackend,
};
