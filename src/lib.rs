// Mediadock - media library backends for authoring tools
// Local disk, Tencent COS, Aliyun OSS, UpYun and Lsky Pro behind one contract

pub mod compressor;
pub mod operations;
pub mod providers;
pub mod settings;

pub use operations::{dispatch, Operation};
pub use providers::{ProviderError, ProviderFactory, ProviderType, StorageProvider};
pub use settings::Settings;
