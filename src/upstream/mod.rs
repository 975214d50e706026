pub mod charge;
pub mod identity;
pub mod marketplace;
pub mod sandbox;

pub use charge::HttpChargeAuthority;
pub use identity::HttpIdentityProvider;
pub use marketplace::{HttpMarketplaceHooks, NoopMarketplaceHooks};
pub use sandbox::{SandboxChargeAuthority, StaticIdentityProvider};
