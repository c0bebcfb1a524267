//! JSON descriptor formats: task descriptors and the board descriptor

use json::JsonValue;

use crate::error::JsonParseError;

fn get_str(obj: &json::object::Object, field: &str) -> Result<String, JsonParseError> {
    let value = obj
        .get(field)
        .ok_or_else(|| JsonParseError::FieldNotFound(field.to_owned()))?;
    value
        .as_str()
        .map(ToOwned::to_owned)
        .ok_or_else(|| JsonParseError::ExpectedString {
            field: field.to_owned(),
            found: format!("{value:?}"),
        })
}

/// Runtime type of a start option, mapped to flag emission rules
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum OptionType {
    /// Emits `-<nsh>` iff the chosen value is truthy
    Bool,
    /// Emits `-<nsh> <value>`
    Int,
}

/// One option in a task's command schema: its type and the single-letter
/// flag the target shell expects
#[derive(Clone, Debug)]
pub struct OptionSpec {
    pub ty: OptionType,
    pub nsh: String,
}

impl TryFrom<&json::object::Object> for OptionSpec {
    type Error = JsonParseError;

    fn try_from(obj: &json::object::Object) -> Result<Self, Self::Error> {
        let ty_str = get_str(obj, "type")?;
        let ty = ty_str
            .parse::<OptionType>()
            .map_err(|_| JsonParseError::UnknownOptionType(ty_str))?;
        let nsh = get_str(obj, "nsh")?;
        Ok(Self { ty, nsh })
    }
}

/// Option schema of one task command, insertion order preserved
#[derive(Clone, Debug, Default)]
pub struct CommandSpec {
    pub options: Vec<(String, OptionSpec)>,
}

impl CommandSpec {
    pub fn option(&self, name: &str) -> Option<&OptionSpec> {
        self.options
            .iter()
            .find(|(option, _)| option == name)
            .map(|(_, spec)| spec)
    }
}

impl TryFrom<&JsonValue> for CommandSpec {
    type Error = JsonParseError;

    fn try_from(value: &JsonValue) -> Result<Self, Self::Error> {
        let JsonValue::Object(obj) = value else {
            return Err(JsonParseError::ExpectedObject(format!("{value:?}")));
        };
        let mut options = Vec::new();
        if let Some(value) = obj.get("options") {
            let JsonValue::Object(entries) = value else {
                return Err(JsonParseError::ExpectedObject(format!("{value:?}")));
            };
            for (name, value) in entries.iter() {
                let JsonValue::Object(spec) = value else {
                    return Err(JsonParseError::ExpectedObject(format!("{value:?}")));
                };
                options.push((name.to_owned(), OptionSpec::try_from(spec)?));
            }
        }
        Ok(Self { options })
    }
}

/// Sensor driver metadata loaded from a `*task.json` file
///
/// Identity is the `name` field, not the file path.
#[derive(Clone, Debug)]
pub struct TaskDescriptor {
    pub name: String,
    /// Names of descriptors this one inherits from
    pub extends: Vec<String>,
    pub commands: Vec<(String, CommandSpec)>,
}

impl TaskDescriptor {
    pub fn command(&self, name: &str) -> Option<&CommandSpec> {
        self.commands
            .iter()
            .find(|(command, _)| command == name)
            .map(|(_, spec)| spec)
    }
}

impl TryFrom<&json::object::Object> for TaskDescriptor {
    type Error = JsonParseError;

    fn try_from(obj: &json::object::Object) -> Result<Self, Self::Error> {
        let name = get_str(obj, "name")?;

        // `extends` may be a single name or a list of names
        let extends = match obj.get("extends") {
            None | Some(JsonValue::Null) => Vec::new(),
            Some(JsonValue::Array(parents)) => parents
                .iter()
                .map(|value| {
                    value
                        .as_str()
                        .map(ToOwned::to_owned)
                        .ok_or_else(|| JsonParseError::ExpectedString {
                            field: "extends".to_owned(),
                            found: format!("{value:?}"),
                        })
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(value) => vec![value.as_str().map(ToOwned::to_owned).ok_or_else(|| {
                JsonParseError::ExpectedString {
                    field: "extends".to_owned(),
                    found: format!("{value:?}"),
                }
            })?],
        };

        let mut commands = Vec::new();
        if let Some(value) = obj.get("commands") {
            let JsonValue::Object(entries) = value else {
                return Err(JsonParseError::ExpectedObject(format!("{value:?}")));
            };
            for (command, value) in entries.iter() {
                commands.push((command.to_owned(), CommandSpec::try_from(value)?));
            }
        }

        Ok(Self {
            name,
            extends,
            commands,
        })
    }
}

/// One task slot on a board interface: the referenced task name and the
/// chosen option values, in declaration order
#[derive(Clone, Debug)]
pub struct TaskRequest {
    pub task: String,
    pub options: Vec<(String, JsonValue)>,
}

impl TryFrom<&json::object::Object> for TaskRequest {
    type Error = JsonParseError;

    fn try_from(obj: &json::object::Object) -> Result<Self, Self::Error> {
        let task = get_str(obj, "task")?;
        let mut options = Vec::new();
        if let Some(value) = obj.get("options") {
            let JsonValue::Object(entries) = value else {
                return Err(JsonParseError::ExpectedObject(format!("{value:?}")));
            };
            for (name, value) in entries.iter() {
                options.push((name.to_owned(), value.clone()));
            }
        }
        Ok(Self { task, options })
    }
}

/// Board descriptor: interfaces, each carrying the tasks it hosts
#[derive(Clone, Debug)]
pub struct BoardDescriptor {
    pub interfaces: Vec<(String, Vec<TaskRequest>)>,
}

impl TryFrom<JsonValue> for BoardDescriptor {
    type Error = JsonParseError;

    fn try_from(value: JsonValue) -> Result<Self, Self::Error> {
        let JsonValue::Object(obj) = &value else {
            return Err(JsonParseError::ExpectedObject(format!("{value:?}")));
        };
        let interfaces_value = obj
            .get("interfaces")
            .ok_or_else(|| JsonParseError::FieldNotFound("interfaces".to_owned()))?;
        let JsonValue::Object(interfaces) = interfaces_value else {
            return Err(JsonParseError::ExpectedObject(format!(
                "{interfaces_value:?}"
            )));
        };

        let mut out = Vec::new();
        for (interface, value) in interfaces.iter() {
            let JsonValue::Object(iface) = value else {
                return Err(JsonParseError::ExpectedObject(format!("{value:?}")));
            };
            let tasks_value = iface
                .get("tasks")
                .ok_or_else(|| JsonParseError::FieldNotFound("tasks".to_owned()))?;
            let JsonValue::Array(tasks) = tasks_value else {
                return Err(JsonParseError::ExpectedArray(format!("{tasks_value:?}")));
            };
            let tasks = tasks
                .iter()
                .map(|value| match value {
                    JsonValue::Object(obj) => TaskRequest::try_from(obj),
                    _ => Err(JsonParseError::ExpectedObject(format!("{value:?}"))),
                })
                .collect::<Result<Vec<_>, _>>()?;
            out.push((interface.to_owned(), tasks));
        }
        Ok(Self { interfaces: out })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    const IMU_TASK: &str = indoc! {r#"
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

    #[test]
    fn task_descriptor_parses() {
        let JsonValue::Object(obj) = json::parse(IMU_TASK).unwrap() else {
            panic!("expected object");
        };
        let task = TaskDescriptor::try_from(&obj).unwrap();
        assert_eq!(task.name, "imu");
        assert!(task.extends.is_empty());

        let start = task.command("start").unwrap();
        let rate = start.option("rate").unwrap();
        assert_eq!(rate.ty, OptionType::Int);
        assert_eq!(rate.nsh, "n");
        let enabled = start.option("enabled").unwrap();
        assert_eq!(enabled.ty, OptionType::Bool);
        assert_eq!(enabled.nsh, "e");
    }

    #[test]
    fn extends_accepts_string_and_list() {
        let JsonValue::Object(obj) =
            json::parse(r#"{"name": "a", "extends": "base"}"#).unwrap()
        else {
            panic!("expected object");
        };
        assert_eq!(TaskDescriptor::try_from(&obj).unwrap().extends, ["base"]);

        let JsonValue::Object(obj) =
            json::parse(r#"{"name": "a", "extends": ["x", "y"]}"#).unwrap()
        else {
            panic!("expected object");
        };
        assert_eq!(TaskDescriptor::try_from(&obj).unwrap().extends, ["x", "y"]);
    }

    #[test]
    fn unknown_option_type_is_an_error() {
        let JsonValue::Object(obj) = json::parse(
            r#"{"name": "a", "commands": {"start": {"options": {"x": {"type": "float", "nsh": "x"}}}}}"#,
        )
        .unwrap() else {
            panic!("expected object");
        };
        assert!(matches!(
            TaskDescriptor::try_from(&obj),
            Err(JsonParseError::UnknownOptionType(ty)) if ty == "float"
        ));
    }

    #[test]
    fn board_descriptor_preserves_declaration_order() {
        let board = BoardDescriptor::try_from(
            json::parse(indoc! {r#"
                {
                    "interfaces": {
                        "spi1": {"tasks": [{"task": "imu", "options": {"rate": 10, "enabled": true}}]},
                        "spi2": {"tasks": [{"task": "mag", "options": {}}]}
                    }
                }
            "#})
            .unwrap(),
        )
        .unwrap();

        assert_eq!(board.interfaces[0].0, "spi1");
        assert_eq!(board.interfaces[1].0, "spi2");
        let options = &board.interfaces[0].1[0].options;
        assert_eq!(options[0].0, "rate");
        assert_eq!(options[1].0, "enabled");
    }
}
