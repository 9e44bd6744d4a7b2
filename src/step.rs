use std::fmt;

// Where the pipeline is. Shows up in logs and in abort reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    // docker installed and running on this machine
    LocalPrecheck,
    ReadConfig,
    // commit hash and message from git
    ComputeVersion,
    BuildImage,
    TagImage,
    PushImage,
    ConnectRemote,
    // is docker on the server
    ProbeRemoteRuntime,
    Bootstrap,
    PullImage,
    RunContainer,
    AppendLedgerEntry,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Step::*;
        let name = match self {
            LocalPrecheck => "local precheck",
            ReadConfig => "read config",
            ComputeVersion => "compute version",
            BuildImage => "build image",
            TagImage => "tag image",
            PushImage => "push image",
            ConnectRemote => "connect",
            ProbeRemoteRuntime => "probe remote runtime",
            Bootstrap => "bootstrap",
            PullImage => "pull image",
            RunContainer => "run container",
            AppendLedgerEntry => "append ledger entry",
        };
        f.write_str(name)
    }
}
