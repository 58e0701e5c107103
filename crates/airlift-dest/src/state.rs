use bitflags::bitflags;

bitflags! {
    /// The daemon's shared state word. The EOC/EOS half tracks the exchange
    /// with the source, the QUIT half the exchange with the supervisor.
    /// Workers wind down once every bit of [`DaemonState::END_MASK`] is set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DaemonState: u32 {
        const EOS_RECEIVED  = 0x0001;
        const EOC_SEND_REQ  = 0x0002;
        const EOC_SENDING   = 0x0004;
        const EOC_SENT      = 0x0008;

        const QUIT_RECEIVED = 0x0010;
        const QUIT_HANDLED  = 0x0020;
        const QUIT_QUEUED   = 0x0040;
        const QUIT_SENDING  = 0x0080;
        const QUIT_SENT     = 0x0100;

        const ERROR_REQ     = 0x1000;
        const ERROR_SENDING = 0x2000;
        const ERROR_SENT    = 0x4000;
    }
}

impl DaemonState {
    pub const QUIT_MASK: DaemonState = DaemonState::QUIT_RECEIVED
        .union(DaemonState::QUIT_HANDLED)
        .union(DaemonState::QUIT_QUEUED)
        .union(DaemonState::QUIT_SENDING)
        .union(DaemonState::QUIT_SENT);

    pub const END_MASK: DaemonState = DaemonState::EOS_RECEIVED
        .union(DaemonState::EOC_SEND_REQ)
        .union(DaemonState::EOC_SENDING)
        .union(DaemonState::EOC_SENT)
        .union(DaemonState::QUIT_MASK);
}
