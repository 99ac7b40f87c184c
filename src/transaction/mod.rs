//! Transaction 系统
//!
//! backref 遍历只读取事务状态：
//!
//! - `seq` - tree mod seq 计数器与 RAII 读者注册（[`SeqElem`]）
//! - `trans` - 运行中事务、事务句柄，以及其 delayed ref 集合
//!
//! 事务的开始、加入与提交由 [`crate::fs::FsInfo`] 负责。
//!
//! ```rust,ignore
//! let trans = fs.start_transaction()?;
//! trans.add_delayed_ref(bytenr, num_bytes, DelayedAction::DropRef, 1, kind)?;
//! fs.commit_transaction(trans)?;
//! ```

mod seq;
mod trans;

pub use seq::{SeqElem, TreeModSeq};
pub use trans::{TransHandle, Transaction, TransactionState};
