// Requests sent by agent clients.
pub const REQUEST_VERSION: u32 = 1;
pub const ADD_KEY: u32 = 202;
pub const DELETE_ALL_KEYS: u32 = 203;
pub const LIST_KEYS: u32 = 204;
pub const PRIVATE_KEY_OP: u32 = 205;
pub const FORWARDING_NOTICE: u32 = 206;

// Responses from the agent.
pub const SUCCESS: u32 = 101;
pub const FAILURE: u32 = 102;
pub const VERSION_RESPONSE: u32 = 103;
pub const KEY_LIST: u32 = 104;
pub const OPERATION_COMPLETE: u32 = 105;

/// The protocol version sent in VERSION_RESPONSE.
pub const VERSION: u32 = 2;
