mod mechanism;
mod state;

pub use self::mechanism::{AnonymousMechanism, ExternalMechanism, Mechanism, MechanismStep};
pub use self::state::{AuthEngine, AuthState};
