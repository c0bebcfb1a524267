//! Render the extracted topology through a line-oriented template

use minijinja::{syntax::SyntaxConfig, Environment, UndefinedBehavior, Value};

use crate::dts::spi::SpiDocument;

/// Render `template` against `doc`
///
/// The template dialect uses `%%` line statements and `%#` line comments;
/// an undefined variable aborts rendering with the engine's diagnostic
/// naming it.
pub fn render_template(template: &str, doc: &SpiDocument) -> Result<String, minijinja::Error> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.set_syntax(
        SyntaxConfig::builder()
            .line_statement_prefix("%%")
            .line_comment_prefix("%#")
            .build()?,
    );
    env.add_template("output", template)?;
    env.get_template("output")?.render(Value::from_serialize(doc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dts::spi::{PinRef, SpiBus, SpiDevice, SpiVersion};
    use indoc::indoc;

    fn sample_doc() -> SpiDocument {
        SpiDocument {
            versions: vec![SpiVersion {
                name: "fmu-v6x".to_owned(),
                busses: vec![SpiBus {
                    name: "spi1".to_owned(),
                    devices: vec![SpiDevice {
                        name: "imu".to_owned(),
                        cs: PinRef {
                            port: "a".to_owned(),
                            pin: 4,
                        },
                        drdy: None,
                    }],
                    supply: Some(PinRef {
                        port: "a".to_owned(),
                        pin: 8,
                    }),
                }],
            }],
        }
    }

    #[test]
    fn line_statements_render_the_document() {
        let template = indoc! {"
            %# per-version bus map
            %% for version in versions
            version {{ version.name }}
            %% for bus in version.busses
            bus {{ bus.name }} supply {{ bus.supply.port }}{{ bus.supply.pin }}
            %% for device in bus.devices
              {{ device.name }} cs {{ device.cs.port }}{{ device.cs.pin }}
            %% endfor
            %% endfor
            %% endfor
        "};
        let output = render_template(template, &sample_doc()).unwrap();
        assert_eq!(
            output,
            "version fmu-v6x\nbus spi1 supply a8\n  imu cs a4\n"
        );
    }

    #[test]
    fn undefined_variables_abort_rendering() {
        let err = render_template("{{ busses }}", &sample_doc()).unwrap_err();
        assert_eq!(err.kind(), minijinja::ErrorKind::UndefinedError);
    }

    #[test]
    fn rendering_is_reproducible() {
        let template = "%% for version in versions\n{{ version.name }}\n%% endfor\n";
        let first = render_template(template, &sample_doc()).unwrap();
        let again = render_template(template, &sample_doc()).unwrap();
        assert_eq!(first, again);
    }
}
