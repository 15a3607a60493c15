//! Runs a [`MovePlan`] on one process.
use tracing::{debug, trace, warn};

use crate::{
    comm::{Communicator, Rank},
    constants::{ALL_TO_N_TAG, CLIENT_DATA_TAG, DEFAULT_COMPRESSION_LEVEL, MOVE_GROUP_TAG, RENDER_DATA_TAG},
    error::{Error, Result},
    moving::{
        marshal::WireBuffer,
        plan::{plan, MoveMode, MovePlan, Step},
    },
    subgroup::SubGroup,
    types::{
        dataset::Dataset,
        topology::{ProcessTopology, Role},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoverConfig {
    pub compress: bool,
    pub compression_level: u32,
    /// Gather all data-server pieces before sending to the client. When unset only data
    /// server rank 0's own piece reaches the client.
    pub gather_for_client: bool,
}

impl Default for MoverConfig {
    fn default() -> Self {
        MoverConfig {
            compress: false,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            gather_for_client: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MoveOutput {
    /// What this process renders.
    pub output: Dataset,
    /// The merged result meant for the client, on the processes that hold it.
    pub collected: Option<Dataset>,
}

pub struct DataMover {
    config: MoverConfig,
}

/// Per-call state threaded through the steps.
struct MoveState<'a> {
    input: &'a Dataset,
    wire: WireBuffer,
    output: Option<Dataset>,
    collected: Option<Dataset>,
}

impl DataMover {
    pub fn new(config: MoverConfig) -> Self {
        DataMover { config }
    }

    pub fn config(&self) -> &MoverConfig {
        &self.config
    }

    fn level(&self) -> Option<u32> {
        self.config.compress.then_some(self.config.compression_level)
    }

    /// Check that this process holds what `plan` will use, before any communication.
    fn validate<C: Communicator>(&self, plan: &MovePlan, topology: &ProcessTopology<C>) -> Result<()> {
        let rank = topology.rank() as usize;
        let missing_client = || Error::MissingChannel {
            role: if topology.role() == Role::Client {
                Role::DataServer
            } else {
                Role::Client
            },
        };
        let missing_render = || Error::MissingChannel {
            role: if topology.role() == Role::RenderServer {
                Role::DataServer
            } else {
                Role::RenderServer
            },
        };

        for step in plan.steps() {
            match step {
                Step::GatherToRoot | Step::BroadcastFromRoot | Step::AllToN if topology.role() != Role::Client => {
                    topology.group()?;
                }
                _ => (),
            }
            match (step, topology.role()) {
                (Step::SendToClient, _) | (Step::ReceiveFromDataServer, Role::Client)
                    if topology.is_group_root() && !topology.has_client_channel() =>
                {
                    return Err(missing_client());
                }
                (Step::SendToRenderServer, _) | (Step::ReceiveFromDataServer, Role::RenderServer)
                    if topology.is_group_root() && !topology.has_render_channel() =>
                {
                    return Err(missing_render());
                }
                (Step::AllToN, _) if rank < topology.render_server_size() && !topology.has_render_channel() => {
                    return Err(missing_render());
                }
                (Step::ReceiveAllToN, _) if rank < topology.data_server_size() && !topology.has_render_channel() => {
                    return Err(missing_render());
                }
                _ => (),
            }
        }
        Ok(())
    }

    /// Move `input` according to `mode`. Every process of every role in the topology must
    /// call this with the same mode.
    pub fn execute<C: Communicator>(
        &self,
        topology: &mut ProcessTopology<C>,
        mode: MoveMode,
        input: &Dataset,
    ) -> Result<MoveOutput> {
        let plan = plan(mode, topology.layout(), topology.role(), self.config.gather_for_client)
            .and_then(|plan| self.validate(&plan, topology).map(|()| plan))
            .map_err(|e| {
                warn!(
                    ?mode,
                    layout = ?topology.layout(),
                    role = ?topology.role(),
                    error = %e,
                    "cannot move data"
                );
                e
            })?;
        debug!(
            ?mode,
            layout = ?topology.layout(),
            role = ?topology.role(),
            rank = topology.rank(),
            "moving data"
        );

        let mut state = MoveState {
            input,
            wire: WireBuffer::new(),
            output: None,
            collected: None,
        };
        for &step in plan.steps() {
            trace!(?step, wire_blocks = state.wire.len(), "move step");
            self.run_step(step, topology, &mut state)?;
        }

        Ok(MoveOutput {
            output: state.output.unwrap_or_else(|| input.empty_like()),
            collected: state.collected,
        })
    }

    fn run_step<C: Communicator>(
        &self,
        step: Step,
        topology: &mut ProcessTopology<C>,
        state: &mut MoveState,
    ) -> Result<()> {
        match step {
            Step::KeepInput => state.output = Some(state.input.clone()),
            Step::Marshal => state.wire = WireBuffer::from_dataset(state.input, self.level())?,
            Step::GatherToRoot => {
                let group = SubGroup::whole(topology.group()?, MOVE_GROUP_TAG)?;
                state.wire = match group.gather_bytes(&state.wire.to_bytes(), 0) {
                    Some(parts) => {
                        let mut gathered = WireBuffer::new();
                        for part in parts {
                            gathered.append(WireBuffer::from_bytes(&part));
                        }
                        gathered
                    }
                    None => WireBuffer::new(),
                };
            }
            Step::BroadcastFromRoot => {
                let group = SubGroup::whole(topology.group()?, MOVE_GROUP_TAG)?;
                let bytes = group.broadcast_bytes(&state.wire.to_bytes(), 0);
                state.wire = WireBuffer::from_bytes(&bytes);
            }
            Step::SendToClient => {
                if topology.is_group_root() {
                    topology
                        .client_channel()?
                        .send(CLIENT_DATA_TAG, &state.wire.to_bytes())?;
                }
            }
            Step::SendToRenderServer => {
                if topology.is_group_root() {
                    topology
                        .render_channel()?
                        .send(RENDER_DATA_TAG, &state.wire.to_bytes())?;
                }
            }
            Step::ReceiveFromDataServer => {
                state.wire = match topology.role() {
                    Role::Client => WireBuffer::from_bytes(&topology.client_channel()?.receive(CLIENT_DATA_TAG)?),
                    _ if topology.is_group_root() => {
                        WireBuffer::from_bytes(&topology.render_channel()?.receive(RENDER_DATA_TAG)?)
                    }
                    _ => WireBuffer::new(),
                };
            }
            Step::AllToN => self.all_to_n(topology, state.input)?,
            Step::ReceiveAllToN => {
                let rank = topology.rank() as usize;
                state.output = if rank < topology.data_server_size() {
                    let bytes = topology.render_channel()?.receive(RENDER_DATA_TAG)?;
                    WireBuffer::from_bytes(&bytes).reconstruct()?
                } else {
                    None
                };
            }
            Step::Reconstruct => state.output = state.wire.reconstruct()?,
            Step::ReconstructCollected => {
                if topology.is_group_root() && !state.wire.is_empty() {
                    state.collected = state.wire.reconstruct()?;
                }
            }
            Step::OutputCollected => state.output = state.collected.clone(),
            Step::Empty => {
                if state.output.is_none() {
                    state.output = Some(state.input.empty_like());
                }
            }
        }
        Ok(())
    }

    /// Data-server rank `i >= N` hands its piece to rank `i % N`; ranks below `N` relay
    /// what they hold to their render-server partner.
    fn all_to_n<C: Communicator>(&self, topology: &mut ProcessTopology<C>, input: &Dataset) -> Result<()> {
        let n = topology.render_server_size().max(1);
        let size = topology.size() as usize;
        let rank = topology.rank() as usize;
        let block = WireBuffer::from_dataset(input, self.level())?;

        if rank >= n {
            topology
                .group()?
                .send((rank % n) as Rank, ALL_TO_N_TAG, &block.to_bytes());
            return Ok(());
        }

        let mut wire = block;
        {
            let group = topology.group()?;
            for source in (rank + n..size).step_by(n) {
                wire.append(WireBuffer::from_bytes(&group.receive(source as Rank, ALL_TO_N_TAG)));
            }
        }
        trace!(rank, blocks = wire.len(), "relaying to render server");
        topology
            .render_channel()?
            .send(RENDER_DATA_TAG, &wire.to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::{Arc, Mutex};
    use std::thread;

    use crate::{
        comm::{channel::LocalChannel, local::LocalCommunicator, local::LocalUniverse},
        types::{dataset::tests::cloud_fixture, topology::Layout},
    };

    type Topology = ProcessTopology<LocalCommunicator>;

    struct Session {
        client: Option<Topology>,
        data: Vec<Topology>,
        render: Vec<Topology>,
    }

    fn session(layout: Layout, data_servers: usize, render_servers: usize) -> Session {
        let mut client_end = None;
        let mut data_client_end = None;
        if layout != Layout::SingleGroup {
            let (a, b) = LocalChannel::pair();
            client_end = Some(a);
            data_client_end = Some(b);
        }

        let mut data_render_ends: Vec<Option<LocalChannel>> = Vec::new();
        let mut render_ends: Vec<Option<LocalChannel>> = Vec::new();
        if layout == Layout::ClientDataRender {
            for i in 0..data_servers.max(render_servers) {
                if i < data_servers.min(render_servers) {
                    let (a, b) = LocalChannel::pair();
                    data_render_ends.push(Some(a));
                    render_ends.push(Some(b));
                } else {
                    data_render_ends.push(None);
                    render_ends.push(None);
                }
            }
        }

        let data = LocalUniverse::communicators(data_servers)
            .into_iter()
            .enumerate()
            .map(|(i, comm)| {
                if layout == Layout::SingleGroup {
                    return ProcessTopology::single_group(comm);
                }
                let client: Option<Box<dyn crate::comm::channel::Channel>> = if i == 0 {
                    data_client_end.take().map(|c| Box::new(c) as _)
                } else {
                    None
                };
                let render = data_render_ends
                    .get_mut(i)
                    .and_then(Option::take)
                    .map(|c| Box::new(c) as _);
                ProcessTopology::data_server(layout, comm, render_servers, client, render)
            })
            .collect();

        let render = if layout == Layout::ClientDataRender {
            LocalUniverse::communicators(render_servers)
                .into_iter()
                .enumerate()
                .map(|(i, comm)| {
                    let channel = render_ends
                        .get_mut(i)
                        .and_then(Option::take)
                        .map(|c| Box::new(c) as _);
                    ProcessTopology::render_server(comm, data_servers, channel)
                })
                .collect()
        } else {
            Vec::new()
        };

        Session {
            client: client_end.map(|c| ProcessTopology::client(layout, data_servers, render_servers, Box::new(c))),
            data,
            render,
        }
    }

    struct Outputs {
        client: Option<MoveOutput>,
        data: Vec<MoveOutput>,
        render: Vec<MoveOutput>,
    }

    /// Data server `i` contributes a cloud of `10 + i` points.
    fn run(session: Session, mode: MoveMode, config: MoverConfig) -> Outputs {
        let mover = DataMover::new(config);
        let mover = &mover;
        thread::scope(|scope| {
            let client = session.client.map(|mut topology| {
                scope.spawn(move || mover.execute(&mut topology, mode, &Dataset::default()).unwrap())
            });
            let data: Vec<_> = session
                .data
                .into_iter()
                .enumerate()
                .map(|(i, mut topology)| {
                    scope.spawn(move || {
                        let input = cloud_fixture(10 + i, i as u64);
                        mover.execute(&mut topology, mode, &input).unwrap()
                    })
                })
                .collect();
            let render: Vec<_> = session
                .render
                .into_iter()
                .map(|mut topology| {
                    scope.spawn(move || mover.execute(&mut topology, mode, &Dataset::default()).unwrap())
                })
                .collect();

            Outputs {
                client: client.map(|h| h.join().unwrap()),
                data: data.into_iter().map(|h| h.join().unwrap()).collect(),
                render: render.into_iter().map(|h| h.join().unwrap()).collect(),
            }
        })
    }

    fn points(output: &MoveOutput) -> usize {
        output.output.number_of_points()
    }

    #[test]
    fn test_clone_single_group() {
        let outputs = run(session(Layout::SingleGroup, 4, 0), MoveMode::Clone, MoverConfig::default());
        for output in outputs.data.iter() {
            assert_eq!(points(output), 10 + 11 + 12 + 13);
        }
    }

    #[test]
    fn test_pass_through_is_idempotent() {
        let first = run(session(Layout::SingleGroup, 3, 0), MoveMode::PassThrough, MoverConfig::default());
        let second = run(session(Layout::SingleGroup, 3, 0), MoveMode::PassThrough, MoverConfig::default());
        for (i, (a, b)) in first.data.iter().zip(second.data.iter()).enumerate() {
            assert_eq!(a, b);
            assert_eq!(a.output, cloud_fixture(10 + i, i as u64));
        }
    }

    #[test]
    fn test_collect_single_group() {
        let outputs = run(session(Layout::SingleGroup, 3, 0), MoveMode::Collect, MoverConfig::default());
        assert_eq!(points(&outputs.data[0]), 33);
        assert_eq!(outputs.data[0].collected.as_ref().map(Dataset::number_of_points), Some(33));
        for output in outputs.data[1..].iter() {
            assert!(output.output.is_empty());
            assert!(output.collected.is_none());
        }
    }

    #[test]
    fn test_collect_to_client() {
        let outputs = run(session(Layout::ClientDataServer, 3, 0), MoveMode::Collect, MoverConfig::default());
        assert_eq!(points(outputs.client.as_ref().unwrap()), 33);
        assert_eq!(points(&outputs.data[0]), 33);
        assert!(outputs.data[1].output.is_empty());
        assert!(outputs.data[2].output.is_empty());
    }

    #[test]
    fn test_collect_without_gather_sends_root_piece() {
        let config = MoverConfig {
            gather_for_client: false,
            compress: true,
            ..MoverConfig::default()
        };
        let outputs = run(session(Layout::ClientDataServer, 3, 0), MoveMode::CollectAndPassThrough, config);
        let client = outputs.client.unwrap();
        assert_eq!(points(&client), 10);
        for (i, output) in outputs.data.iter().enumerate() {
            assert_eq!(points(output), 10 + i);
            assert_eq!(output.collected.is_some(), i == 0);
        }
    }

    #[test]
    fn test_pass_through_all_to_n() {
        let outputs = run(session(Layout::ClientDataRender, 5, 2), MoveMode::PassThrough, MoverConfig::default());
        assert!(outputs.client.unwrap().output.is_empty());
        assert!(outputs.data.iter().all(|o| o.output.is_empty()));
        assert_eq!(points(&outputs.render[0]), 10 + 12 + 14);
        assert_eq!(points(&outputs.render[1]), 11 + 13);
    }

    #[test]
    fn test_clone_through_render_servers() {
        let config = MoverConfig {
            compress: true,
            ..MoverConfig::default()
        };
        let outputs = run(session(Layout::ClientDataRender, 3, 2), MoveMode::Clone, config);
        assert_eq!(points(outputs.client.as_ref().unwrap()), 33);
        assert!(outputs.data.iter().all(|o| o.output.is_empty()));
        for output in outputs.render.iter() {
            assert_eq!(points(output), 33);
        }
    }

    #[test]
    fn test_collect_and_pass_through_with_spare_render_servers() {
        let outputs = run(
            session(Layout::ClientDataRender, 2, 3),
            MoveMode::CollectAndPassThrough,
            MoverConfig::default(),
        );
        assert_eq!(points(outputs.client.as_ref().unwrap()), 21);
        assert_eq!(points(&outputs.render[0]), 10);
        assert_eq!(points(&outputs.render[1]), 11);
        assert!(outputs.render[2].output.is_empty());
    }

    /// Log sink shared with a scoped subscriber.
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_missing_resources_are_logged() {
        let captured = Captured::default();
        let sink = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || sink.clone())
            .with_ansi(false)
            .finish();

        let comm = LocalUniverse::communicators(1).pop().unwrap();
        let mut topology = ProcessTopology::data_server(Layout::ClientDataServer, comm, 0, None, None);
        let mover = DataMover::new(MoverConfig::default());
        let result = tracing::subscriber::with_default(subscriber, || {
            mover.execute(&mut topology, MoveMode::Collect, &cloud_fixture(3, 0))
        });
        assert!(result.is_err());

        let logged = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(logged.contains("WARN"), "{}", logged);
        assert!(logged.contains("cannot move data"), "{}", logged);
        assert!(logged.contains("Collect"), "{}", logged);
    }

    #[test]
    fn test_missing_resources_fail_before_communicating() {
        let comm = LocalUniverse::communicators(1).pop().unwrap();
        let mut topology = ProcessTopology::data_server(Layout::ClientDataServer, comm, 0, None, None);
        let mover = DataMover::new(MoverConfig::default());
        assert!(matches!(
            mover.execute(&mut topology, MoveMode::Collect, &cloud_fixture(3, 0)),
            Err(Error::MissingChannel { role: Role::Client })
        ));

        let (a, _b) = LocalChannel::pair();
        let mut client: Topology = ProcessTopology::client(Layout::SingleGroup, 1, 1, Box::new(a));
        assert!(matches!(
            mover.execute(&mut client, MoveMode::Clone, &Dataset::default()),
            Err(Error::InvalidTopology(_))
        ));
    }
}
