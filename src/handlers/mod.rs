//! Built-in command handlers.

pub mod basic;
pub mod traffic_agent;

use crate::dispatch::{RegistryBuilder, RegistryError, any_params};

/// Register every command this crate implements itself.
pub fn register_builtin(b: &mut RegistryBuilder) -> Result<(), RegistryError> {
    b.register("ca_get_version", any_params, basic::ca_get_version)?
        .register("device_get_info", any_params, basic::device_get_info)?
        .register(
            "traffic_agent_config",
            traffic_agent::validate_config,
            traffic_agent::config,
        )?
        .register("traffic_agent_reset", any_params, traffic_agent::reset)?
        .register(
            "traffic_agent_send",
            traffic_agent::validate_stream_ids,
            traffic_agent::send,
        )?
        .register(
            "traffic_agent_receive_start",
            traffic_agent::validate_stream_ids,
            traffic_agent::receive_start,
        )?
        .register(
            "traffic_agent_receive_stop",
            traffic_agent::validate_stream_ids,
            traffic_agent::receive_stop,
        )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentState;
    use crate::dispatch::{ConnContext, Dispatcher};
    use crate::proto::{Status, WireResponse};
    use std::sync::mpsc;

    fn dispatcher() -> Dispatcher {
        let mut b = RegistryBuilder::new();
        register_builtin(&mut b).unwrap();
        Dispatcher::new(b.build())
    }

    #[test]
    fn builtins_registered_once() {
        let mut b = RegistryBuilder::new();
        register_builtin(&mut b).unwrap();
        assert!(matches!(
            register_builtin(&mut b),
            Err(RegistryError::Duplicate(_))
        ));
        assert_eq!(b.build().len(), 7);
    }

    #[test]
    fn version_and_device_info() {
        let d = dispatcher();
        let mut agent = AgentState::default();
        agent.device.interface = Some("wlan0".into());
        let (tx, _rx) = mpsc::channel();
        let mut conn = ConnContext::new(1, tx);

        assert_eq!(
            d.dispatch(&mut agent, &mut conn, "ca_get_version"),
            WireResponse::complete(Some(format!("version,{}", basic::VERSION)))
        );
        assert_eq!(
            d.dispatch(&mut agent, &mut conn, "device_get_info").payload,
            Some(format!(
                "vendor,Generic,model,DUT,version,{},interface,wlan0",
                basic::VERSION
            ))
        );
    }

    #[test]
    fn traffic_commands_through_dispatcher() {
        let d = dispatcher();
        let mut agent = AgentState::default();
        let (tx, _rx) = mpsc::channel();
        let mut conn = ConnContext::new(1, tx);

        assert_eq!(
            d.dispatch(&mut agent, &mut conn, "traffic_agent_config,profile,IPTV").status,
            Status::Invalid
        );
        assert_eq!(
            d.dispatch(
                &mut agent,
                &mut conn,
                "traffic_agent_config,profile,Multicast,direction,receive,destination,10.0.0.1"
            ),
            WireResponse::with_error_code(
                Status::Invalid,
                "invalid stream parameters: multicast receiver needs a multicast destination"
            )
        );
        assert_eq!(
            d.dispatch(
                &mut agent,
                &mut conn,
                "traffic_agent_config,profile,File_Transfer,direction,receive"
            ),
            WireResponse::complete(Some("streamID,1".into()))
        );
        assert_eq!(
            d.dispatch(&mut agent, &mut conn, "traffic_agent_receive_start").status,
            Status::Invalid
        );
        assert_eq!(
            d.dispatch(&mut agent, &mut conn, "traffic_agent_receive_start,streamID,1").status,
            Status::Complete
        );
        assert_eq!(
            d.dispatch(&mut agent, &mut conn, "traffic_agent_reset"),
            WireResponse::complete(None)
        );
        assert!(agent.streams.is_empty());
    }
}
