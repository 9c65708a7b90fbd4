#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub action: &'static str,
}

/// Commands whose whole remainder is one raw argument, stored under `arg_key`.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RawArgCommandSpec {
    pub spec: CommandSpec,
    pub arg_key: &'static str,
}

pub(crate) const RAW_ARG_COMMANDS: &[RawArgCommandSpec] = &[
    RawArgCommandSpec {
        spec: CommandSpec {
            command: "model",
            action: "set_model",
        },
        arg_key: "model",
    },
    RawArgCommandSpec {
        spec: CommandSpec {
            command: "system",
            action: "set_system",
        },
        arg_key: "text",
    },
];

pub(crate) const TURN_ID_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "edit",
        action: "edit",
    },
    CommandSpec {
        command: "delete",
        action: "delete",
    },
    CommandSpec {
        command: "regen",
        action: "regenerate",
    },
];

pub(crate) const SINGLE_PATH_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "attach",
        action: "attach_image",
    },
    CommandSpec {
        command: "image",
        action: "inject_image",
    },
];

pub(crate) const NO_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "help",
        action: "help",
    },
    CommandSpec {
        command: "models",
        action: "list_models",
    },
    CommandSpec {
        command: "list",
        action: "list",
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

pub const CHAT_HELP_COMMANDS: &[&str] = &[
    "/help",
    "/models",
    "/model <name>",
    "/attach <path>",
    "/image <path>",
    "/edit <id>",
    "/delete <id>",
    "/regen <id>",
    "/system <text>",
    "/list",
    "/quit",
];
