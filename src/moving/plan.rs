//! The steps each role runs for a move, per (mode, layout, role).
//!
//! Every process of a role runs the same steps, so the collectives inside a role's group
//! always match. What differs between ranks is confined to channel legs, which only the
//! ranks holding the channel take.
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    types::topology::{Layout, Role},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MoveMode {
    /// Every process keeps its own piece.
    PassThrough,
    /// Pieces are merged on one root, everyone else ends up empty.
    Collect,
    /// Every process ends up with the merged whole.
    Clone,
    /// A collect towards the client next to a pass-through towards the renderers.
    CollectAndPassThrough,
}

impl MoveMode {
    pub const ALL: [MoveMode; 4] = [
        MoveMode::PassThrough,
        MoveMode::Collect,
        MoveMode::Clone,
        MoveMode::CollectAndPassThrough,
    ];
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Step {
    /// Output the local input unchanged.
    KeepInput,
    /// Encode the local input into the wire buffer.
    Marshal,
    /// Gather the wire buffers of the group on its rank 0. Collective.
    GatherToRoot,
    /// Replace every wire buffer of the group with rank 0's. Collective.
    BroadcastFromRoot,
    /// Group rank 0 sends its wire buffer to the client.
    SendToClient,
    /// Group rank 0 sends its wire buffer to render-server rank 0.
    SendToRenderServer,
    /// The client, or render-server rank 0, receives the data servers' wire buffer.
    ReceiveFromDataServer,
    /// Fold the data-server pieces onto as many ranks as there are render servers and relay
    /// them over the paired channels. Point-to-point inside the group.
    AllToN,
    /// Render-server side of [`Step::AllToN`].
    ReceiveAllToN,
    /// Output the merge of the wire buffer.
    Reconstruct,
    /// Keep the merge of the wire buffer as the collected result, where it is non-empty.
    ReconstructCollected,
    /// Output the collected result, or an empty dataset where there is none.
    OutputCollected,
    /// Output an empty dataset unless an output was already produced.
    Empty,
}

/// Operations that every member of a group must issue together.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Collective {
    Gather,
    Broadcast,
    AllToN,
}

/// A message over one of the socket legs, as seen by the sender or the receiver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Leg {
    DataToClient,
    DataToRender,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MovePlan {
    pub mode: MoveMode,
    pub layout: Layout,
    pub role: Role,
    steps: Vec<Step>,
}

/// Steps shared by every collect path on the data servers.
fn collect_on_data_servers(gather_for_client: bool, client: bool) -> Vec<Step> {
    let mut steps = vec![Step::Marshal];
    if gather_for_client || !client {
        steps.push(Step::GatherToRoot);
    }
    if client {
        steps.push(Step::SendToClient);
    }
    steps.push(Step::ReconstructCollected);
    steps
}

/// Plan a move for one role. Fails for a role that has no processes in `layout`.
pub fn plan(mode: MoveMode, layout: Layout, role: Role, gather_for_client: bool) -> Result<MovePlan> {
    use MoveMode::*;
    use Step::*;

    let steps = match (layout, role) {
        (Layout::SingleGroup, Role::DataServer) => match mode {
            PassThrough => vec![KeepInput],
            Collect => {
                let mut steps = collect_on_data_servers(true, false);
                steps.push(OutputCollected);
                steps
            }
            Clone => vec![Marshal, GatherToRoot, BroadcastFromRoot, Reconstruct],
            CollectAndPassThrough => {
                let mut steps = collect_on_data_servers(true, false);
                steps.push(KeepInput);
                steps
            }
        },

        (Layout::ClientDataServer | Layout::ClientDataRender, Role::Client) => match mode {
            PassThrough => vec![Empty],
            Collect | CollectAndPassThrough => {
                vec![ReceiveFromDataServer, ReconstructCollected, OutputCollected]
            }
            Clone => vec![ReceiveFromDataServer, Reconstruct],
        },

        (Layout::ClientDataServer, Role::DataServer) => match mode {
            PassThrough => vec![KeepInput],
            Collect => {
                let mut steps = collect_on_data_servers(gather_for_client, true);
                steps.push(OutputCollected);
                steps
            }
            Clone => vec![Marshal, GatherToRoot, BroadcastFromRoot, SendToClient, Reconstruct],
            CollectAndPassThrough => {
                let mut steps = collect_on_data_servers(gather_for_client, true);
                steps.push(KeepInput);
                steps
            }
        },

        (Layout::ClientDataRender, Role::DataServer) => match mode {
            PassThrough => vec![AllToN, Empty],
            Collect => {
                let mut steps = collect_on_data_servers(gather_for_client, true);
                steps.push(OutputCollected);
                steps
            }
            Clone => vec![Marshal, GatherToRoot, SendToClient, SendToRenderServer, Empty],
            CollectAndPassThrough => {
                let mut steps = collect_on_data_servers(gather_for_client, true);
                steps.extend([AllToN, Empty]);
                steps
            }
        },

        (Layout::ClientDataRender, Role::RenderServer) => match mode {
            PassThrough | CollectAndPassThrough => vec![ReceiveAllToN],
            Collect => vec![Empty],
            Clone => vec![ReceiveFromDataServer, BroadcastFromRoot, Reconstruct],
        },

        (layout, role) => {
            return Err(Error::InvalidTopology(format!(
                "{:?} has no {:?} processes",
                layout, role
            )))
        }
    };

    Ok(MovePlan {
        mode,
        layout,
        role,
        steps,
    })
}

impl MovePlan {
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Collectives issued inside the role's group, in order.
    pub fn collectives(&self) -> Vec<Collective> {
        self.steps
            .iter()
            .filter_map(|step| match step {
                Step::GatherToRoot => Some(Collective::Gather),
                Step::BroadcastFromRoot => Some(Collective::Broadcast),
                Step::AllToN => Some(Collective::AllToN),
                _ => None,
            })
            .collect()
    }

    /// Socket messages sent, in order.
    pub fn sends(&self) -> Vec<Leg> {
        self.steps
            .iter()
            .filter_map(|step| match step {
                Step::SendToClient => Some(Leg::DataToClient),
                Step::SendToRenderServer | Step::AllToN => Some(Leg::DataToRender),
                _ => None,
            })
            .collect()
    }

    /// Socket messages received, in order.
    pub fn receives(&self) -> Vec<Leg> {
        self.steps
            .iter()
            .filter_map(|step| match (step, self.role) {
                (Step::ReceiveFromDataServer, Role::Client) => Some(Leg::DataToClient),
                (Step::ReceiveFromDataServer, Role::RenderServer) | (Step::ReceiveAllToN, _) => {
                    Some(Leg::DataToRender)
                }
                _ => None,
            })
            .collect()
    }

    pub fn needs_group(&self) -> bool {
        !self.collectives().is_empty()
    }
}
