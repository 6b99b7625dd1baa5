pub mod allocator;
pub mod factory;
pub mod token;

pub use allocator::{
    Allocation, Allocator, CookieAllocator, FnAllocator, PathAllocator, RequestView,
    DEFAULT_COOKIE_NAME, SOCKET_IO_PATTERN, SOCKJS_PATTERN,
};
pub use factory::AllocatorFactory;
pub use token::{decode_token, StickyToken};
