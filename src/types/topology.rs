//! Roles of the process groups taking part in a session and the channels between them.
//!
//! A topology is built once by the session bootstrap and passed by reference to every
//! component; nothing in the crate keeps a process-wide default.
use serde::{Deserialize, Serialize};

use crate::{
    comm::{channel::Channel, Communicator, Rank},
    error::{Error, Result},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Client,
    DataServer,
    RenderServer,
}

/// Which roles live in separate process groups joined by socket channels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Layout {
    /// One group does everything; there are no channels.
    SingleGroup,
    /// A client connected to a data-server group that also renders.
    ClientDataServer,
    /// A client, a data-server group and a separate render-server group.
    ClientDataRender,
}

impl Layout {
    pub const ALL: [Layout; 3] = [
        Layout::SingleGroup,
        Layout::ClientDataServer,
        Layout::ClientDataRender,
    ];

    /// Roles that have processes in this layout.
    pub fn roles(&self) -> &'static [Role] {
        match self {
            Layout::SingleGroup => &[Role::DataServer],
            Layout::ClientDataServer => &[Role::Client, Role::DataServer],
            Layout::ClientDataRender => &[Role::Client, Role::DataServer, Role::RenderServer],
        }
    }

    /// Rendering happens outside the client's process.
    pub fn is_remote_rendering(&self) -> bool {
        !matches!(self, Layout::SingleGroup)
    }
}

/// This process's place in the session.
///
/// * `group` is the communicator of the process's own role (none for a client).
/// * `client_channel` is held by the client and by data-server rank 0.
/// * `render_channel` is held by the data-server ranks below the render-server size and by
///   the render-server ranks below the data-server size, pairing rank `i` with rank `i`.
pub struct ProcessTopology<C: Communicator> {
    role: Role,
    layout: Layout,
    group: Option<C>,
    data_server_size: usize,
    render_server_size: usize,
    client_channel: Option<Box<dyn Channel>>,
    render_channel: Option<Box<dyn Channel>>,
}

impl<C: Communicator> ProcessTopology<C> {
    /// All roles collapsed into one group.
    pub fn single_group(group: C) -> Self {
        let size = group.size() as usize;
        ProcessTopology {
            role: Role::DataServer,
            layout: Layout::SingleGroup,
            group: Some(group),
            data_server_size: size,
            render_server_size: size,
            client_channel: None,
            render_channel: None,
        }
    }

    pub fn client(
        layout: Layout,
        data_server_size: usize,
        render_server_size: usize,
        channel: Box<dyn Channel>,
    ) -> Self {
        ProcessTopology {
            role: Role::Client,
            layout,
            group: None,
            data_server_size,
            render_server_size,
            client_channel: Some(channel),
            render_channel: None,
        }
    }

    pub fn data_server(
        layout: Layout,
        group: C,
        render_server_size: usize,
        client_channel: Option<Box<dyn Channel>>,
        render_channel: Option<Box<dyn Channel>>,
    ) -> Self {
        let data_server_size = group.size() as usize;
        let render_server_size = match layout {
            Layout::ClientDataRender => render_server_size,
            _ => data_server_size,
        };
        ProcessTopology {
            role: Role::DataServer,
            layout,
            group: Some(group),
            data_server_size,
            render_server_size,
            client_channel,
            render_channel,
        }
    }

    pub fn render_server(
        group: C,
        data_server_size: usize,
        render_channel: Option<Box<dyn Channel>>,
    ) -> Self {
        let render_server_size = group.size() as usize;
        ProcessTopology {
            role: Role::RenderServer,
            layout: Layout::ClientDataRender,
            group: Some(group),
            data_server_size,
            render_server_size,
            client_channel: None,
            render_channel,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// The communicator of this process's own role.
    pub fn group(&self) -> Result<&C> {
        self.group.as_ref().ok_or(Error::MissingCommunicator)
    }

    /// Rank inside the role's group; a client is its own group of one.
    pub fn rank(&self) -> Rank {
        self.group.as_ref().map_or(0, |g| g.rank())
    }

    pub fn size(&self) -> Rank {
        self.group.as_ref().map_or(1, |g| g.size())
    }

    pub fn is_group_root(&self) -> bool {
        self.rank() == 0
    }

    pub fn data_server_size(&self) -> usize {
        self.data_server_size
    }

    pub fn render_server_size(&self) -> usize {
        self.render_server_size
    }

    pub fn has_client_channel(&self) -> bool {
        self.client_channel.is_some()
    }

    pub fn has_render_channel(&self) -> bool {
        self.render_channel.is_some()
    }

    /// Channel towards the client (on a data server) or the data servers (on the client).
    pub fn client_channel(&mut self) -> Result<&mut (dyn Channel + 'static)> {
        let role = if self.role == Role::Client {
            Role::DataServer
        } else {
            Role::Client
        };
        self.client_channel
            .as_deref_mut()
            .ok_or(Error::MissingChannel { role })
    }

    /// Channel between paired data-server and render-server ranks.
    pub fn render_channel(&mut self) -> Result<&mut (dyn Channel + 'static)> {
        let role = if self.role == Role::RenderServer {
            Role::DataServer
        } else {
            Role::RenderServer
        };
        self.render_channel
            .as_deref_mut()
            .ok_or(Error::MissingChannel { role })
    }
}
