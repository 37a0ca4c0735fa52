pub type Endpoint = str;

pub const PRODUCTION: &Endpoint = "/production.json";
/// 603980032 is the EID of the EMU device that owns the power mode register.
pub const POWER_MODE: &Endpoint = "/ivp/mod/603980032/mode/power";
pub const CHECK_JWT: &Endpoint = "/auth/check_jwt";
pub const AUTH_CALLBACK: &Endpoint = "/auth/callback";
pub const INFO: &Endpoint = "/info.xml";
