/// mDNS service type under which DIS publishers advertise themselves
pub const DIS_SERVICE_TYPE: &str = "_dis._tcp.local.";

/// Instance name used when the relay advertises itself
pub const DEFAULT_SERVICE_NAME: &str = "ESPDU-PRODUCER";

/// Free-text TXT attribute carried by the advertisement, as `key=value`
pub const DEFAULT_TXT_ATTRIBUTE: &str = "foo=bar";

