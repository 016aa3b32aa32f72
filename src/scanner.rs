//! Unified entry point: discover an adapter, connect, run diagnostic
//! sessions, send requests.
//!
//! The [Scanner] owns the channel manager and the connection state manager
//! and wires them together with the UDS engine. Destructive operations are
//! routed through the safety gate before anything reaches the wire; state
//! observers get the manager's event stream through [Scanner::events].

use std::path::Path;
use std::sync::mpsc;

use crate::channel::ChannelError;
use crate::isotp::{IsoTpLink, IsoTpSettings};
use crate::passthru::manager::{ChannelManager, ChannelRequest, ManagerConfig};
use crate::passthru::{DeviceInfo, DeviceScanner, FilterKind, PassThruDevice, Protocol};
use crate::safety::{
    check_preconditions, ConditionSource, GatedOperation, VehicleConditions,
};
use crate::state::{
    ConnectionStateManager, StateEvent, StateManagerConfig, StateRepository,
};
use crate::timing::{TimingParams, VehicleProfile};
use crate::transport::{ConnectionType, TransportEvent, TransportInfo};
use crate::uds::{UdsCommand, UdsServer, UdsServerOptions, UdsSessionType};
use crate::{DiagError, DiagServerResult};

/// Everything configurable about a scanner
#[derive(Debug)]
pub struct ScannerOptions {
    /// UDS engine options
    pub uds: UdsServerOptions,
    /// ISO-TP framing options
    pub isotp: IsoTpSettings,
    /// Channel manager limits
    pub manager: ManagerConfig,
    /// State manager tunables
    pub state: StateManagerConfig,
    /// Manufacturer timing profile to overlay, if known
    pub vehicle_profile: Option<VehicleProfile>,
}

impl Default for ScannerOptions {
    fn default() -> Self {
        Self {
            uds: UdsServerOptions::default(),
            isotp: IsoTpSettings::default(),
            manager: ManagerConfig::default(),
            state: StateManagerConfig::default(),
            vehicle_profile: None,
        }
    }
}

/// High level scanner facade over one pass-thru adapter.
pub struct Scanner {
    name: String,
    options: ScannerOptions,
    state_manager: ConnectionStateManager,
    conditions: Option<Box<dyn ConditionSource>>,
    channel_manager: Option<ChannelManager>,
    channel_id: Option<u32>,
    uds: Option<UdsServer>,
    connection_id: Option<String>,
}

impl std::fmt::Debug for Scanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Scanner({})", self.name)
    }
}

impl Scanner {
    /// Lists the adapters installed under `descriptor_dir`.
    pub fn discover(descriptor_dir: &Path) -> Vec<DeviceInfo> {
        DeviceScanner::scan_dir(descriptor_dir).list_devices().to_vec()
    }

    /// Creates a scanner persisting connection state into `repository`.
    pub fn new(name: &str, repository: Box<dyn StateRepository>, options: ScannerOptions) -> Self {
        let state_manager = ConnectionStateManager::new(repository, options.state);
        Self {
            name: name.to_string(),
            options,
            state_manager,
            conditions: None,
            channel_manager: None,
            channel_id: None,
            uds: None,
            connection_id: None,
        }
    }

    /// Installs a live source of vehicle conditions for the safety gate.
    /// Without one, the gate falls back to the adapter's voltage reading and
    /// a stationary-vehicle assumption.
    pub fn set_condition_source(&mut self, source: Box<dyn ConditionSource>) {
        self.conditions = Some(source);
    }

    /// The state manager's event stream.
    pub fn events(&self) -> mpsc::Receiver<StateEvent> {
        self.state_manager.subscribe()
    }

    /// The connection state manager, for registering additional transports.
    pub fn state_manager(&self) -> &ConnectionStateManager {
        &self.state_manager
    }

    /// Opens the device, creates the diagnostic channel and brings up the
    /// UDS engine on it.
    pub fn connect(&mut self, device: PassThruDevice) -> DiagServerResult<()> {
        if self.uds.is_some() {
            return Err(DiagError::ParameterInvalid);
        }
        let peer = device.info().product.clone();
        let connection_id = format!("{}-j2534", self.name);

        let manager = ChannelManager::new(device, self.options.manager);
        let channel = manager.create_channel(ChannelRequest::iso15765(
            self.options.isotp.can_speed,
        ))?;

        // Overlay the vehicle profile onto the channel's timing table and
        // the ISO-TP window we advertise
        let mut isotp_cfg = self.options.isotp;
        if let Some(profile) = self.options.vehicle_profile {
            let mut timing = TimingParams::defaults_for(Protocol::Iso15765);
            profile.apply(Protocol::Iso15765, &mut timing);
            isotp_cfg.block_size = timing.block_size;
            isotp_cfg.st_min = timing.st_min;
            manager.set_param(
                channel,
                crate::timing::TimingParam::Iso15765BlockSize,
                timing.block_size as u32,
            )?;
            manager.set_param(
                channel,
                crate::timing::TimingParam::Iso15765StMin,
                timing.st_min as u32,
            )?;
        }

        manager.add_filter(
            channel,
            FilterKind::Pass,
            vec![0xFF; 4],
            self.options.uds.recv_id.to_be_bytes().to_vec(),
            None,
        )?;

        let borrowed = manager.can_channel(channel)?;
        let link = IsoTpLink::new(Box::new(borrowed));
        let uds = UdsServer::new_over_iso_tp(self.options.uds, Box::new(link), isotp_cfg, None)?;

        self.state_manager
            .register(&connection_id, &self.name, ConnectionType::J2534)
            .map_err(|_| DiagError::ParameterInvalid)?;
        let _ = self.state_manager.handle_transport_event(
            &connection_id,
            &TransportEvent::Connected(TransportInfo {
                peer,
                connection_type: ConnectionType::J2534,
            }),
        );

        self.channel_manager = Some(manager);
        self.channel_id = Some(channel);
        self.uds = Some(uds);
        self.connection_id = Some(connection_id);
        log::info!("scanner {} connected", self.name);
        Ok(())
    }

    /// Tears the diagnostic stack down.
    pub fn disconnect(&mut self) {
        self.uds = None;
        if let (Some(manager), Some(channel)) = (&self.channel_manager, self.channel_id) {
            let _ = manager.close_channel(channel);
        }
        self.channel_id = None;
        self.channel_manager = None;
        if let Some(id) = self.connection_id.take() {
            let _ = self
                .state_manager
                .handle_transport_event(&id, &TransportEvent::Disconnected);
            let _ = self.state_manager.unregister(&id);
        }
        log::info!("scanner {} disconnected", self.name);
    }

    /// Switches the diagnostic session, running the matching precondition
    /// check first.
    pub fn session(&mut self, session_type: UdsSessionType) -> DiagServerResult<()> {
        let gate = match session_type {
            UdsSessionType::Programming => GatedOperation::ProgrammingSession,
            UdsSessionType::SafetySystem => GatedOperation::SafetySystemSession,
            _ => GatedOperation::SessionChange,
        };
        self.check_gate(gate)?;
        self.uds_mut()?.set_session_mode(session_type)
    }

    /// Sends one service request and returns the positive response.
    /// Destructive services are checked against the safety gate first.
    pub fn send(&mut self, service: UdsCommand, args: &[u8]) -> DiagServerResult<Vec<u8>> {
        if let Some(gate) = Self::gate_for(service, args) {
            self.check_gate(gate)?;
        }
        self.uds_mut()?.execute_command_with_response(service, args)
    }

    /// Reads every stored DTC.
    pub fn read_all_dtcs(&mut self) -> DiagServerResult<Vec<crate::dtc::Dtc>> {
        crate::uds::read_dtc_information::get_dtcs_by_status_mask(self.uds_mut()?, 0xFF)
    }

    /// Clears every stored DTC, subject to the safety gate.
    pub fn clear_all_dtcs(&mut self) -> DiagServerResult<()> {
        self.check_gate(GatedOperation::DtcClearing)?;
        crate::uds::clear_diagnostic_information::clear_diagnostic_information(
            self.uds_mut()?,
            crate::uds::clear_diagnostic_information::ALL_DTC_GROUPS,
        )
    }

    /// Reads the vehicle identification number.
    pub fn read_vin(&mut self) -> DiagServerResult<String> {
        crate::uds::read_data_by_identifier::read_vin(self.uds_mut()?)
    }

    /// Direct access to the UDS engine for the service helper modules.
    pub fn uds_server(&mut self) -> DiagServerResult<&mut UdsServer> {
        self.uds_mut()
    }

    fn uds_mut(&mut self) -> DiagServerResult<&mut UdsServer> {
        self.uds.as_mut().ok_or(DiagError::ServerNotRunning)
    }

    fn gate_for(service: UdsCommand, args: &[u8]) -> Option<GatedOperation> {
        match service {
            UdsCommand::RequestDownload
            | UdsCommand::TransferData
            | UdsCommand::RequestTransferExit => Some(GatedOperation::EcuProgramming),
            UdsCommand::ClearDiagnosticInformation => Some(GatedOperation::DtcClearing),
            UdsCommand::WriteDataByIdentifier => Some(GatedOperation::EcuCoding),
            UdsCommand::ECUReset | UdsCommand::SecurityAccess => {
                Some(GatedOperation::SessionChange)
            }
            UdsCommand::DiagnosticSessionControl => Some(match args.first() {
                Some(0x02) => GatedOperation::ProgrammingSession,
                Some(0x04) => GatedOperation::SafetySystemSession,
                _ => GatedOperation::SessionChange,
            }),
            _ => None,
        }
    }

    fn check_gate(&mut self, operation: GatedOperation) -> DiagServerResult<()> {
        let conditions = self.current_conditions()?;
        match check_preconditions(operation, &conditions) {
            Ok(warnings) => {
                for w in warnings {
                    log::warn!("{operation}: {}", w.message);
                }
                Ok(())
            }
            Err(report) => {
                log::error!("{operation} blocked: {report}");
                Err(DiagError::SafetyViolation(report))
            }
        }
    }

    fn current_conditions(&mut self) -> DiagServerResult<VehicleConditions> {
        if let Some(source) = self.conditions.as_mut() {
            return source.read_conditions().map_err(|e| {
                log::error!("condition read failed: {e}");
                DiagError::ChannelError(ChannelError::Other(e))
            });
        }
        // No live data: trust the adapter's voltage pin and assume a parked
        // vehicle, the most common bench situation
        let voltage = self
            .channel_manager
            .as_ref()
            .and_then(|m| m.read_battery_voltage())
            .unwrap_or(12.6);
        Ok(VehicleConditions::key_on_engine_off(voltage))
    }
}

impl Drop for Scanner {
    fn drop(&mut self) {
        if self.uds.is_some() {
            self.disconnect();
        }
    }
}
