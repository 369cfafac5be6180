// 同步引擎：快照轮询、推送连接、合并视图
pub mod poller;
pub mod rolling_buffer;
pub mod stream;
pub mod view;

pub use poller::{fetch_fn, FetchFn, PollState, PollerConfig, SnapshotPoller};
pub use rolling_buffer::RollingBuffer;
pub use stream::{
    ConnectionStats, ConnectionStatus, EventFilter, EventKind, StreamConnection, StreamConnector, StreamEvent,
    StreamSocket, Subscription, TungsteniteConnector,
};
pub use view::{MergedView, MergedViewModel, ValueSource, ViewModelDriver};
