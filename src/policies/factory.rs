use std::sync::Arc;

use log::info;

use super::allocator::{Allocator, CookieAllocator, PathAllocator};
use crate::config::{AllocatorConfig, ConfigResult};

pub struct AllocatorFactory;

impl AllocatorFactory {
    pub fn create(config: &AllocatorConfig) -> ConfigResult<Arc<dyn Allocator>> {
        let allocator: Arc<dyn Allocator> = match config {
            AllocatorConfig::Cookie { name } => {
                let cookie = CookieAllocator::new(name.clone());
                info!("Sticky sessions keyed by cookie {}", cookie.cookie_name());
                Arc::new(cookie)
            }
            AllocatorConfig::SocketIo => Self::path(PathAllocator::socket_io()),
            AllocatorConfig::SockJs => Self::path(PathAllocator::sockjs()),
            AllocatorConfig::Pattern(pattern) => Self::path(PathAllocator::new(pattern)?),
        };
        Ok(allocator)
    }

    fn path(allocator: PathAllocator) -> Arc<dyn Allocator> {
        info!(
            "Sticky sessions keyed by {} path pattern {}",
            allocator.name(),
            allocator.pattern()
        );
        Arc::new(allocator)
    }
}
