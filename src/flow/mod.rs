/// Flow state machine — derives one finalized `Flow` from a connection's
/// packet buffer: handshake validation, data-transfer and closing phases,
/// abort/invalid verdicts, and final lifecycle labeling.
use crate::models::{
    CloseType, ConnectionKey, Flow, FlowState, InvalidReason, PacketRecord, PhaseEntry, Phases,
    PhaseTag,
};

/// Evaluates a connection's packets in chronological order and returns the
/// reconstructed flow.
///
/// The buffer is sorted by timestamp before evaluation, so arrival order
/// (within or across ingestion batches) does not affect the outcome. Totals
/// and the start/end window are computed over the full sorted buffer up
/// front; a handshake-validation failure stops evaluation early, leaving the
/// recorded packet list shorter than `total_packets`.
pub fn assemble(key: ConnectionKey, mut packets: Vec<PacketRecord>, id: String) -> Flow {
    packets.sort_by_key(|p| p.timestamp);

    let mut flow = Flow {
        id,
        key,
        initiator: None,
        responder: None,
        initiator_port: None,
        responder_port: None,
        state: FlowState::New,
        phases: Phases::default(),
        establishment_complete: false,
        data_transfer_started: false,
        closing_started: false,
        close_type: None,
        start_time: packets.first().map(|p| p.timestamp).unwrap_or(0),
        end_time: packets.last().map(|p| p.timestamp).unwrap_or(0),
        total_packets: packets.len() as u64,
        total_bytes: packets.iter().map(|p| p.length).sum(),
        invalid_reason: None,
        expected_seq_num: None,
        expected_ack_num: None,
        invalid_packet: None,
        syn_packet: None,
        syn_ack_packet: None,
        packets: Vec::with_capacity(packets.len()),
        ongoing: false,
        completed_by_timeout: false,
    };

    for packet in &packets {
        flow.packets.push(packet.clone());

        // Packets after an invalid verdict stay in the list but are not
        // evaluated
        if flow.state == FlowState::Invalid {
            continue;
        }

        let f = packet.tcp_flags();

        if f.syn && !f.ack && !f.rst {
            // Connection initiation; retransmitted SYNs are ignored
            if flow.initiator.is_none() {
                flow.initiator = Some(packet.src_ip.clone());
                flow.responder = Some(packet.dst_ip.clone());
                flow.initiator_port = Some(packet.src_port);
                flow.responder_port = Some(packet.dst_port);
                flow.state = FlowState::Establishing;
                flow.syn_packet = Some(packet.clone());
                flow.expected_ack_num = Some(packet.seq_num + 1);
                flow.phases
                    .establishment
                    .push(PhaseEntry::new(packet.clone(), PhaseTag::Syn));
            }
        } else if f.syn && f.ack && !f.rst {
            if flow.state == FlowState::Establishing && flow.syn_packet.is_some() {
                // The acceptance must acknowledge the initiator's sequence
                if Some(packet.ack_num) == flow.expected_ack_num {
                    flow.syn_ack_packet = Some(packet.clone());
                    flow.expected_seq_num = Some(packet.seq_num + 1);
                    flow.phases
                        .establishment
                        .push(PhaseEntry::new(packet.clone(), PhaseTag::SynAck));
                } else {
                    flow.state = FlowState::Invalid;
                    flow.invalid_reason = Some(InvalidReason::InvalidSynack);
                    flow.invalid_packet = Some(packet.clone());
                    flow.close_type = Some(CloseType::Invalid);
                    break;
                }
            } else if flow.syn_ack_packet.is_none() {
                flow.phases
                    .establishment
                    .push(PhaseEntry::new(packet.clone(), PhaseTag::SynAck));
                flow.syn_ack_packet = Some(packet.clone());
            }
        } else if f.ack
            && !f.syn
            && !f.fin
            && !f.rst
            && !f.psh
            && flow.state == FlowState::Establishing
        {
            // Pure ACK completing the handshake
            if flow.syn_ack_packet.is_some() && flow.expected_seq_num.is_some() {
                if Some(packet.ack_num) == flow.expected_seq_num
                    && Some(packet.seq_num) == flow.expected_ack_num
                {
                    flow.phases
                        .establishment
                        .push(PhaseEntry::new(packet.clone(), PhaseTag::Ack));
                    flow.establishment_complete = true;
                    flow.state = FlowState::Established;
                } else {
                    flow.state = FlowState::Invalid;
                    flow.invalid_reason = Some(InvalidReason::InvalidAck);
                    flow.invalid_packet = Some(packet.clone());
                    flow.close_type = Some(CloseType::Invalid);
                    break;
                }
            } else if !flow.establishment_complete {
                flow.phases
                    .establishment
                    .push(PhaseEntry::new(packet.clone(), PhaseTag::Ack));
                flow.establishment_complete = true;
                flow.state = FlowState::Established;
            }
        } else if f.ack
            && !f.syn
            && !f.fin
            && !f.rst
            && flow.establishment_complete
            && packet.length > 0
        {
            if !flow.data_transfer_started {
                flow.data_transfer_started = true;
                flow.state = FlowState::DataTransfer;
            }
            flow.phases
                .data_transfer
                .push(PhaseEntry::new(packet.clone(), PhaseTag::Data));
        } else if f.fin && !f.rst {
            if !flow.closing_started {
                flow.closing_started = true;
                flow.state = FlowState::Closing;
                flow.close_type = Some(CloseType::Graceful);
            }
            flow.phases
                .closing
                .push(PhaseEntry::new(packet.clone(), PhaseTag::Fin));
        } else if f.rst {
            if flow.state == FlowState::Establishing {
                flow.invalid_reason = Some(InvalidReason::RstDuringHandshake);
                flow.state = FlowState::Invalid;
                flow.close_type = Some(CloseType::Invalid);
            } else {
                flow.state = FlowState::Aborted;
                flow.close_type = Some(CloseType::Abortive);
            }
            flow.invalid_packet = Some(packet.clone());
            flow.phases
                .closing
                .push(PhaseEntry::new(packet.clone(), PhaseTag::Rst));
        } else if f.ack && !f.syn && !f.fin && !f.rst && flow.establishment_complete {
            if flow.closing_started {
                flow.phases
                    .closing
                    .push(PhaseEntry::new(packet.clone(), PhaseTag::AckClose));
            } else {
                if !flow.data_transfer_started {
                    flow.data_transfer_started = true;
                    flow.state = FlowState::DataTransfer;
                }
                flow.phases
                    .data_transfer
                    .push(PhaseEntry::new(packet.clone(), PhaseTag::AckData));
            }
        }
    }

    finalize(&mut flow);
    flow
}

/// Post-loop labeling: incomplete handshakes become `invalid` with the
/// missing milestone as the reason, an open close sequence becomes `closed`,
/// and flows that got past establishment without any close signal are
/// relabeled `ongoing`.
fn finalize(flow: &mut Flow) {
    if flow.state == FlowState::Establishing {
        if flow.syn_packet.is_none() {
            flow.state = FlowState::Invalid;
            flow.invalid_reason = Some(InvalidReason::IncompleteNoSyn);
            flow.close_type = Some(CloseType::Invalid);
        } else if flow.syn_ack_packet.is_none() {
            flow.state = FlowState::Invalid;
            flow.invalid_reason = Some(InvalidReason::IncompleteNoSynack);
            flow.close_type = Some(CloseType::Invalid);
        } else if !flow.establishment_complete {
            flow.state = FlowState::Invalid;
            flow.invalid_reason = Some(InvalidReason::IncompleteNoAck);
            flow.close_type = Some(CloseType::Invalid);
        }
    } else if flow.state == FlowState::Closing {
        flow.state = FlowState::Closed;
    }

    if !matches!(
        flow.state,
        FlowState::Invalid | FlowState::Closed | FlowState::Aborted
    ) && flow.close_type.is_none()
        && (flow.establishment_complete || flow.data_transfer_started)
    {
        flow.state = FlowState::Ongoing;
        flow.ongoing = true;
        flow.close_type = Some(CloseType::Open);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
