//! Resolve board descriptors against task descriptors into start commands

// Anything that's part of the public API of descriptor is also part of the
// public API of boardcfg
pub use descriptor::*;

mod descriptor;

use std::{collections::HashMap, fmt, path};

use fs_err as fs;
use itertools::Itertools;
use json::JsonValue;
use log::{info, warn};

use crate::{
    error::{BoardError, DescriptorFileError, JsonParseError},
    util,
};

/// All task descriptors discovered for a build, keyed by task name
pub struct TaskSet {
    tasks: Vec<TaskDescriptor>,
    index: HashMap<String, usize>,
    /// Inheritance links, parent index -> child indexes; filled by
    /// [`TaskSet::resolve_inheritance`]
    children: Vec<Vec<usize>>,
}

impl TaskSet {
    /// Load every `*task.json` descriptor under `root`
    ///
    /// A descriptor whose name was already taken replaces the earlier one,
    /// matching the last-loaded-wins behavior of a plain map insert.
    pub fn load(root: &path::Path) -> Result<Self, DescriptorFileError> {
        let files = util::find_task_files(root)
            .map_err(|err| JsonParseError::from(err).with_fname(root.display().to_string()))?;
        let mut set = Self {
            tasks: Vec::with_capacity(files.len()),
            index: HashMap::new(),
            children: Vec::new(),
        };
        for file in files {
            info!("Loading {}", file.display());
            let fname = file.display().to_string();
            let task = parse_descriptor_file(&file).map_err(|err| err.with_fname(fname))?;
            set.insert(task);
        }
        Ok(set)
    }

    fn insert(&mut self, task: TaskDescriptor) {
        if let Some(&existing) = self.index.get(&task.name) {
            warn!("task {:?} redefined, keeping the later definition", task.name);
            self.tasks[existing] = task;
        } else {
            self.index.insert(task.name.clone(), self.tasks.len());
            self.tasks.push(task);
        }
    }

    pub fn get(&self, name: &str) -> Option<&TaskDescriptor> {
        self.index.get(name).map(|&idx| &self.tasks[idx])
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskDescriptor> {
        self.tasks.iter()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Link every descriptor under its named `extends` parents
    ///
    /// # Errors
    ///
    /// An `extends` target absent from the set fails with
    /// [`BoardError::UnknownParent`].
    pub fn resolve_inheritance(&mut self) -> Result<(), BoardError> {
        let mut children = vec![Vec::new(); self.tasks.len()];
        for (idx, task) in self.tasks.iter().enumerate() {
            for parent in &task.extends {
                let &parent_idx =
                    self.index
                        .get(parent)
                        .ok_or_else(|| BoardError::UnknownParent {
                            task: task.name.clone(),
                            parent: parent.clone(),
                        })?;
                children[parent_idx].push(idx);
            }
        }
        self.children = children;
        Ok(())
    }

    /// Render the descriptor hierarchy as an ASCII tree, roots being the
    /// descriptors that extend nothing
    ///
    /// Call [`TaskSet::resolve_inheritance`] first to populate the links.
    pub fn render_tree(&self) -> String {
        let mut out = String::new();
        for (idx, task) in self.tasks.iter().enumerate() {
            if task.extends.is_empty() {
                out.push_str(&task.name);
                out.push('\n');
                self.render_children(idx, "", &mut out);
            }
        }
        out
    }

    fn render_children(&self, idx: usize, prefix: &str, out: &mut String) {
        let children = match self.children.get(idx) {
            Some(children) => children,
            None => return,
        };
        for (position, &child) in children.iter().enumerate() {
            let last = position + 1 == children.len();
            out.push_str(prefix);
            out.push_str(if last { "╰── " } else { "├── " });
            out.push_str(&self.tasks[child].name);
            out.push('\n');
            let deeper = format!("{prefix}{}", if last { "    " } else { "│   " });
            self.render_children(child, &deeper, out);
        }
    }
}

fn parse_descriptor_file(path: &path::Path) -> Result<TaskDescriptor, JsonParseError> {
    let text = fs::read_to_string(path)?;
    let value = json::parse(&text)?;
    let JsonValue::Object(obj) = &value else {
        return Err(JsonParseError::ExpectedObject(format!("{value:?}")));
    };
    TaskDescriptor::try_from(obj)
}

/// Load the board descriptor from `path`
pub fn load_board(path: &path::Path) -> Result<BoardDescriptor, DescriptorFileError> {
    info!("Loading {}", path.display());
    let fname = path.display().to_string();
    let parse = || -> Result<BoardDescriptor, JsonParseError> {
        let text = fs::read_to_string(path)?;
        BoardDescriptor::try_from(json::parse(&text)?)
    };
    parse().map_err(|err| err.with_fname(fname))
}

/// One resolved `<task> <args> start` command line
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StartCommand {
    pub task: String,
    pub args: String,
}

impl fmt::Display for StartCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} start", self.task, self.args)
    }
}

/// Resolve every task referenced by `board` into a start command
///
/// Output order follows the board file: interface declaration order, then
/// task order within the interface, then option declaration order.
///
/// # Errors
///
/// - Task name with no loaded descriptor
/// - Option not declared in the task's start schema
/// - Int option value that does not coerce to an integer
pub fn resolve_start_commands(
    tasks: &TaskSet,
    board: &BoardDescriptor,
) -> Result<Vec<StartCommand>, BoardError> {
    let mut commands = Vec::new();
    for (_interface, requests) in &board.interfaces {
        for request in requests {
            let task = tasks
                .get(&request.task)
                .ok_or_else(|| BoardError::UnknownTask(request.task.clone()))?;
            let start = task
                .command("start")
                .ok_or_else(|| BoardError::MissingStartCommand {
                    task: request.task.clone(),
                })?;

            let mut args = Vec::new();
            for (option, value) in &request.options {
                let spec = start
                    .option(option)
                    .ok_or_else(|| BoardError::UnknownOption {
                        task: request.task.clone(),
                        option: option.clone(),
                    })?;
                match spec.ty {
                    OptionType::Bool => {
                        if truthy(value) {
                            args.push(format!("-{}", spec.nsh));
                        }
                    }
                    OptionType::Int => {
                        let value =
                            coerce_int(value).ok_or_else(|| BoardError::InvalidOptionValue {
                                task: request.task.clone(),
                                option: option.clone(),
                                value: format!("{value:?}"),
                            })?;
                        args.push(format!("-{} {value}", spec.nsh));
                    }
                }
            }
            commands.push(StartCommand {
                task: request.task.clone(),
                args: args.iter().join(" "),
            });
        }
    }
    Ok(commands)
}

/// Truthiness of a chosen option value: null, false, zero, and empty
/// strings/collections are falsy, everything else truthy
fn truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Boolean(b) => *b,
        JsonValue::Number(_) => value.as_f64().is_some_and(|f| f != 0.0),
        JsonValue::Short(_) | JsonValue::String(_) => {
            !value.as_str().unwrap_or_default().is_empty()
        }
        JsonValue::Array(values) => !values.is_empty(),
        JsonValue::Object(obj) => obj.len() != 0,
    }
}

/// Integer coercion of a chosen option value: numbers truncate toward zero,
/// strings parse as decimal, booleans map to 0/1
fn coerce_int(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Boolean(b) => Some(i64::from(*b)),
        JsonValue::Number(_) => value.as_f64().map(|f| f as i64),
        JsonValue::Short(_) | JsonValue::String(_) => value.as_str()?.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    fn task_set(descriptors: &[&str]) -> TaskSet {
        let mut set = TaskSet {
            tasks: Vec::new(),
            index: HashMap::new(),
            children: Vec::new(),
        };
        for text in descriptors {
            let JsonValue::Object(obj) = json::parse(text).unwrap() else {
                panic!("expected object");
            };
            set.insert(TaskDescriptor::try_from(&obj).unwrap());
        }
        set
    }

    const IMU: &str = indoc! {r#"
        {
            "name": "imu",
            "commands": {
                "start": {
                    "options": {
                        "rate": {"type": "int", "nsh": "n"},
                        "enabled": {"type": "bool", "nsh": "e"}
                    }
                }
            }
        }
    "#};

    fn board(text: &str) -> BoardDescriptor {
        BoardDescriptor::try_from(json::parse(text).unwrap()).unwrap()
    }

    #[test]
    fn imu_example_resolves_end_to_end() {
        let tasks = task_set(&[IMU]);
        let board = board(
            r#"{"interfaces": {"spi1": {"tasks": [
                {"task": "imu", "options": {"rate": 10, "enabled": true}}
            ]}}}"#,
        );
        let commands = resolve_start_commands(&tasks, &board).unwrap();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].to_string(), "imu -n 10 -e start");
    }

    #[test]
    fn falsy_bool_contributes_no_flag() {
        let tasks = task_set(&[IMU]);
        let board = board(
            r#"{"interfaces": {"spi1": {"tasks": [
                {"task": "imu", "options": {"rate": 20, "enabled": false}}
            ]}}}"#,
        );
        let commands = resolve_start_commands(&tasks, &board).unwrap();
        assert_eq!(commands[0].to_string(), "imu -n 20 start");
    }

    #[test]
    fn unknown_task_fails() {
        let tasks = task_set(&[IMU]);
        let board = board(r#"{"interfaces": {"spi1": {"tasks": [{"task": "baro", "options": {}}]}}}"#);
        assert!(matches!(
            resolve_start_commands(&tasks, &board),
            Err(BoardError::UnknownTask(name)) if name == "baro"
        ));
    }

    #[test]
    fn undeclared_option_fails() {
        let tasks = task_set(&[IMU]);
        let board = board(
            r#"{"interfaces": {"spi1": {"tasks": [{"task": "imu", "options": {"gain": 2}}]}}}"#,
        );
        assert!(matches!(
            resolve_start_commands(&tasks, &board),
            Err(BoardError::UnknownOption { task, option }) if task == "imu" && option == "gain"
        ));
    }

    #[test]
    fn command_order_follows_board_declaration_order() {
        let mag = r#"{"name": "mag", "commands": {"start": {"options": {}}}}"#;
        let tasks = task_set(&[IMU, mag]);
        let board = board(indoc! {r#"
            {
                "interfaces": {
                    "spi2": {"tasks": [{"task": "mag", "options": {}}]},
                    "spi1": {"tasks": [{"task": "imu", "options": {"rate": 10}}]}
                }
            }
        "#});
        let commands = resolve_start_commands(&tasks, &board).unwrap();
        let names = commands.iter().map(|c| c.task.as_str()).collect::<Vec<_>>();
        assert_eq!(names, ["mag", "imu"]);
    }

    #[test]
    fn int_coercion_matches_loose_inputs() {
        assert_eq!(coerce_int(&json::parse("10").unwrap()), Some(10));
        assert_eq!(coerce_int(&json::parse("10.7").unwrap()), Some(10));
        assert_eq!(coerce_int(&JsonValue::from("42")), Some(42));
        assert_eq!(coerce_int(&JsonValue::from(true)), Some(1));
        assert_eq!(coerce_int(&JsonValue::from("ten")), None);
    }

    #[test]
    fn truthiness_matches_loose_inputs() {
        assert!(truthy(&JsonValue::from(1)));
        assert!(truthy(&JsonValue::from("false")));
        assert!(!truthy(&JsonValue::from(0)));
        assert!(!truthy(&JsonValue::from("")));
        assert!(!truthy(&JsonValue::Null));
    }

    #[test]
    fn inheritance_links_descriptors_under_parents() {
        let base = r#"{"name": "sensor_base"}"#;
        let imu = r#"{"name": "imu", "extends": "sensor_base"}"#;
        let mag = r#"{"name": "mag", "extends": ["sensor_base"]}"#;
        let mut tasks = task_set(&[base, imu, mag]);
        tasks.resolve_inheritance().unwrap();
        let tree = tasks.render_tree();
        assert_eq!(tree, "sensor_base\n├── imu\n╰── mag\n");
    }

    #[test]
    fn unknown_parent_fails_with_its_name() {
        let orphan = r#"{"name": "imu", "extends": "ghost"}"#;
        let mut tasks = task_set(&[orphan]);
        assert!(matches!(
            tasks.resolve_inheritance(),
            Err(BoardError::UnknownParent { task, parent }) if task == "imu" && parent == "ghost"
        ));
    }
}
