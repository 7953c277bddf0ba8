mod allocator;

pub use allocator::AddressAllocator;
