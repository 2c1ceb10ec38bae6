pub mod funnel_repo;
pub use funnel_repo::FunnelRepository;
