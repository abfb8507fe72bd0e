//! Top-level actions recorded in a record and replayed from a payload.

use crate::codec::{self, Json};
use crate::creation::Creation;
use crate::error::KernelError;
use crate::payload::{Command, Op};
use crate::value::{ObjectRef, Props, Value};

#[derive(Clone, Debug)]
pub enum Action {
    /// Code deployed together, with the source and properties each was given.
    Deploy {
        codes: Vec<Creation>,
        entries: Vec<(String, Props)>,
    },
    Upgrade {
        code: Creation,
        src: String,
        props: Props,
    },
    Destroy {
        target: Creation,
    },
    Auth {
        target: Creation,
    },
    Call {
        target: Creation,
        method: String,
        args: Vec<Value>,
    },
    New {
        class: Creation,
        args: Vec<Value>,
    },
}

impl Action {
    pub fn op(&self) -> Op {
        match self {
            Action::Deploy { .. } => Op::Deploy,
            Action::Upgrade { .. } => Op::Upgrade,
            Action::Destroy { .. } => Op::Destroy,
            Action::Auth { .. } => Op::Auth,
            Action::Call { .. } => Op::Call,
            Action::New { .. } => Op::New,
        }
    }

    /// The action's arguments as one value, the shape carried in `cmds[].data`.
    fn data(&self) -> Value {
        let list = |items: Vec<Value>| Value::Object(ObjectRef::array(items));
        let props = |p: &Props| Value::Object(ObjectRef::plain(p.clone()));
        match self {
            Action::Deploy { entries, .. } => list(
                entries
                    .iter()
                    .flat_map(|(src, p)| [Value::from(src.as_str()), props(p)])
                    .collect(),
            ),
            Action::Upgrade { code, src, props: p } => list(vec![
                Value::Creation(code.clone()),
                Value::from(src.as_str()),
                props(p),
            ]),
            Action::Destroy { target } | Action::Auth { target } => Value::Creation(target.clone()),
            Action::Call {
                target,
                method,
                args,
            } => list(vec![
                Value::Creation(target.clone()),
                Value::from(method.as_str()),
                list(args.clone()),
            ]),
            Action::New { class, args } => list(vec![Value::Creation(class.clone()), list(args.clone())]),
        }
    }

    /// Encode as a payload command; creations are written as master-list indices.
    pub fn to_command(
        &self,
        saver: &dyn Fn(&Creation) -> Result<Json, KernelError>,
    ) -> Result<Command, KernelError> {
        Ok(Command {
            op: self.op(),
            data: codec::encode(&self.data(), saver)?,
        })
    }
}
