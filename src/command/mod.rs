// 控制命令：二次确认门与具体的远程命令
pub mod confirm;
pub mod remote;

pub use confirm::{CommandOutcome, ConfirmState, ConfirmationGatedAction, InvokeOutcome, RemoteCommand};
pub use remote::{EmergencyStop, ResumeTrading};
