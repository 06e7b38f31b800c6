use crate::agent::AgentState;
use crate::dispatch::{ConnContext, Outcome};
use crate::proto::ParamSet;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn ca_get_version(_: &mut AgentState, _: &ConnContext, _: &ParamSet) -> Outcome {
    Outcome::Complete(Some(format!("version,{}", VERSION)))
}

pub fn device_get_info(agent: &mut AgentState, _: &ConnContext, _: &ParamSet) -> Outcome {
    let d = &agent.device;
    let mut out = format!("vendor,{},model,{},version,{}", d.vendor, d.model, VERSION);
    if let Some(ifname) = &d.interface {
        out.push_str(",interface,");
        out.push_str(ifname);
    }
    Outcome::Complete(Some(out))
}
