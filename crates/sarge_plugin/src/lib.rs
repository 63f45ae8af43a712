pub mod bus;
pub mod descriptor;
pub mod message;
pub mod plugin;

pub use bus::{AppFilter, Event, EventBus, EventHandler, PluginRegistrar, Signal};
pub use descriptor::{
    AppDescriptor, AutoRestart, DEFAULT_PROGRAM, DeploymentConfig, ProgramSpec, ServiceSpec, UrlEntry,
};
pub use message::{
    APPCFG_ENV, ActivationContext, AppConfig, Program, QUICK_WSGI_SOCKET, Target, TargetKind,
};
pub use plugin::{CommandOutput, CommandRunner, PluginError, SystemCommandRunner};
