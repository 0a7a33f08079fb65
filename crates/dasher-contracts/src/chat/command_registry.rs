#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub action: &'static str,
}

pub(crate) const RAW_ARG_COMMANDS: &[CommandSpec] = &[CommandSpec {
    command: "endpoint",
    action: "set_endpoint",
}];

/// Generation settings that take one numeric argument; the command name is
/// also the settings key.
pub(crate) const SETTING_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "steps",
        action: "set_steps",
    },
    CommandSpec {
        command: "guidance",
        action: "set_guidance",
    },
];

pub(crate) const SINGLE_PATH_COMMANDS: &[CommandSpec] = &[CommandSpec {
    command: "analyze",
    action: "analyze_image",
}];

pub(crate) const NO_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "help",
        action: "help",
    },
    CommandSpec {
        command: "reset",
        action: "reset",
    },
    CommandSpec {
        command: "plan",
        action: "show_plan",
    },
    CommandSpec {
        command: "history",
        action: "show_history",
    },
    CommandSpec {
        command: "status",
        action: "show_status",
    },
    CommandSpec {
        command: "quit",
        action: "quit",
    },
    CommandSpec {
        command: "exit",
        action: "quit",
    },
];

pub(crate) const PICK_COMMAND: CommandSpec = CommandSpec {
    command: "pick",
    action: "select_option",
};

pub(crate) const EXPORT_COMMAND: CommandSpec = CommandSpec {
    command: "export",
    action: "export",
};

pub const CHAT_HELP_COMMANDS: &[&str] = &[
    "/pick",
    "/plan",
    "/history",
    "/status",
    "/reset",
    "/steps",
    "/guidance",
    "/endpoint",
    "/analyze",
    "/export",
    "/help",
    "/quit",
];
