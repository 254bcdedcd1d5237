// Source (topic exchange) constants

/// Sources every broker declares by default
pub const BUILT_IN_SOURCES: [&str; 7] = [
    "amq.direct",
    "amq.topic",
    "amq.fanout",
    "amq.headers",
    "amq.match",
    "rabbitmq.log",
    "rabbitmq.trace",
];

/// Nameless exchange that routes by queue name; used to republish
pub const DEFAULT_EXCHANGE: &str = "";

pub fn is_built_in_source(name: &str) -> bool {
    BUILT_IN_SOURCES.contains(&name)
}
