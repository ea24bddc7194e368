pub use crate::bridge::{
    BridgeConnection, BridgeSubscription, BrokerConnector, BrokerConnectorConfig,
};
pub use crate::bus::{Bus, ChannelManager, MessageHandler};
pub use crate::channel::{Channel, MessageHandlerFn};
pub use crate::error::{BridgeError, BusError};
pub use crate::model::{Direction, Message, MessageConfig, Payload, payload};
pub use crate::monitor::{MonitorEvent, MonitorEventKind, MonitorPayload, MonitorStream};
pub use crate::utils::{LoggerConfig, WaitGroup};
