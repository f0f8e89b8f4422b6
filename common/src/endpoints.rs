pub const ROUTE_UPDATE: &str = "/update";
pub const ROUTE_STATUS: &str = "/api/status";
pub const ROUTE_PUSH: &str = "/";

pub const FORM_FIELD_CITY: &str = "city";
pub const FORM_FIELD_WEATHER: &str = "weather";
pub const FORM_FIELD_TEMP: &str = "temp";

pub const TOKEN_STOP: &str = "STOP";
pub const TOKEN_RESUME: &str = "RESUME";
pub const TOKEN_MANUAL: &str = "MANUAL";

pub const STATUS_STOPPED: &str = "STOPPED";
