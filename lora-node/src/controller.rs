//! Home-controller application: answers pings, climate queries and commands, serves and stores streams.

use std::path::PathBuf;

use lora_core::protocol::{
    ClimateData, CommandRequest, CommandResponse, CommandStatus, CommandType, Data, DataRequest,
    DataType, StreamRequest, StreamType,
};
use lora_core::{Handler, Link, Metadata, NodeId, Payload, StreamAnomaly};

use crate::config::Config;

pub struct HomeController {
    climate: ClimateData,
    stream_file: Option<PathBuf>,
    output_dir: PathBuf,
    triggers: u32,
    value: u8,
    received: Vec<PathBuf>,
}

impl HomeController {
    pub fn new(config: &Config) -> Self {
        Self {
            climate: config.climate,
            stream_file: config.stream_file.clone(),
            output_dir: config.output_dir.clone(),
            triggers: 0,
            value: 0,
            received: Vec::new(),
        }
    }

    pub fn triggers(&self) -> u32 {
        self.triggers
    }

    pub fn value(&self) -> u8 {
        self.value
    }

    /// Files written for completed inbound streams, oldest first.
    pub fn received(&self) -> &[PathBuf] {
        &self.received
    }

    fn output_path(&self, peer: NodeId, stream_id: u8, stream_type: StreamType) -> PathBuf {
        let ext = match stream_type {
            StreamType::Jpeg => "jpg",
            StreamType::Raw => "bin",
        };
        self.output_dir
            .join(format!("stream-{}-{stream_id}.{ext}", peer.as_u8()))
    }
}

impl Handler for HomeController {
    fn on_ping_request(&mut self, link: &mut Link<'_>, meta: &Metadata) {
        tracing::debug!(peer = %meta.source, "ping");
        if let Err(e) = link.reply(meta, Payload::PingResponse) {
            tracing::warn!(error = %e, peer = %meta.source, "pong not sent");
        }
    }

    fn on_ping_response(&mut self, _link: &mut Link<'_>, meta: &Metadata) {
        tracing::info!(peer = %meta.source, "pong");
    }

    fn on_data_request(&mut self, link: &mut Link<'_>, meta: &Metadata, req: &DataRequest) {
        let data = match req.data_type {
            DataType::Climate => Data::Climate(self.climate),
        };
        if let Err(e) = link.reply(meta, Payload::Data(data)) {
            tracing::warn!(error = %e, peer = %meta.source, "data reply not sent");
        }
    }

    fn on_data(&mut self, _link: &mut Link<'_>, meta: &Metadata, data: &Data) {
        match data {
            Data::Climate(c) => tracing::info!(
                peer = %meta.source,
                temperature = f32::from(c.temperature_tenths) / 10.0,
                humidity = f32::from(c.humidity_tenths) / 10.0,
                "climate reading"
            ),
        }
    }

    fn on_command_request(&mut self, link: &mut Link<'_>, meta: &Metadata, req: &CommandRequest) {
        match req.command_type {
            CommandType::Trigger => self.triggers += 1,
            CommandType::SetValue => self.value = req.value,
        }
        tracing::info!(peer = %meta.source, command = ?req.command_type, value = req.value, "command");
        let resp = CommandResponse {
            command_type: req.command_type,
            status: CommandStatus::Success,
        };
        if let Err(e) = link.reply(meta, Payload::CommandResponse(resp)) {
            tracing::warn!(error = %e, peer = %meta.source, "command response not sent");
        }
    }

    fn on_command_response(&mut self, _link: &mut Link<'_>, meta: &Metadata, resp: &CommandResponse) {
        tracing::info!(
            peer = %meta.source,
            command = ?resp.command_type,
            status = ?resp.status,
            "command response"
        );
    }

    fn on_stream_request(&mut self, link: &mut Link<'_>, meta: &Metadata, req: &StreamRequest) {
        let Some(path) = &self.stream_file else {
            tracing::debug!(peer = %meta.source, "stream requested but no stream_file configured");
            return;
        };
        let data = match std::fs::read(path) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "stream_file unreadable");
                return;
            }
        };
        match link.start_stream(meta.source, req.stream_type, &data) {
            Ok(stream_id) => {
                tracing::info!(peer = %meta.source, stream_id, bytes = data.len(), "serving stream")
            }
            Err(e) => tracing::warn!(error = %e, peer = %meta.source, "stream not started"),
        }
    }

    fn on_stream_received(
        &mut self,
        _link: &mut Link<'_>,
        peer: NodeId,
        stream_id: u8,
        stream_type: StreamType,
        data: Vec<u8>,
    ) {
        let path = self.output_path(peer, stream_id, stream_type);
        match std::fs::write(&path, &data) {
            Ok(()) => {
                tracing::info!(path = %path.display(), bytes = data.len(), "stream saved");
                self.received.push(path);
            }
            Err(e) => tracing::warn!(error = %e, path = %path.display(), "stream not saved"),
        }
    }

    fn on_stream_aborted(
        &mut self,
        _link: &mut Link<'_>,
        peer: NodeId,
        stream_id: u8,
        reason: StreamAnomaly,
    ) {
        tracing::warn!(peer = %peer, stream_id, %reason, "stream aborted");
    }

    fn on_stream_sent(&mut self, _link: &mut Link<'_>, peer: NodeId, stream_id: u8) {
        tracing::info!(peer = %peer, stream_id, "stream delivered to peer");
    }
}
