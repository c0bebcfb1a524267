//! Extract SPI bus wiring from the devicetree into a version-tagged
//! document ready for serialization and template rendering

use serde::Serialize;

use crate::dts::model::{Cell, Devicetree, NodeId};
use crate::error::SpiError;

/// One GPIO of a wiring role: port letter (controller label with the
/// literal `gpio` removed) and pin number
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PinRef {
    pub port: String,
    pub pin: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SpiDevice {
    pub name: String,
    pub cs: PinRef,
    pub drdy: Option<PinRef>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SpiBus {
    pub name: String,
    pub devices: Vec<SpiDevice>,
    pub supply: Option<PinRef>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SpiVersion {
    pub name: String,
    pub busses: Vec<SpiBus>,
}

/// Root of the extraction output; top-level template context
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SpiDocument {
    pub versions: Vec<SpiVersion>,
}

/// Extract every enabled SPI bus, its devices and their wiring
///
/// Buses appear in global enumeration order, devices in the order they are
/// declared under the bus.
///
/// # Errors
///
/// - No string `version` property on the first enumerated node
/// - A bus or controller without the labels/properties the wiring needs
/// - A device whose unit address indexes past the `cs-gpios` list
pub fn extract_spi_topology(dt: &Devicetree) -> Result<SpiDocument, SpiError> {
    let order = dt.global_order();
    let first = order[0];
    let version = dt
        .string_prop(first, "version")
        .ok_or_else(|| SpiError::MissingVersion {
            node: dt.path(first),
        })?
        .to_owned();

    let mut busses = Vec::new();
    for &bus in &order {
        if !dt.node(bus).name().contains("spi@") || dt.status(bus) != "okay" {
            continue;
        }
        let bus_name = dt
            .first_label(bus)
            .ok_or_else(|| SpiError::UnlabeledBus { bus: dt.path(bus) })?
            .to_owned();
        let cs_prop = dt
            .prop(bus, "cs-gpios")
            .ok_or_else(|| SpiError::MissingProperty {
                bus: dt.path(bus),
                property: "cs-gpios".to_owned(),
            })?;
        let cs_pins = gpio_entries(dt, bus, &cs_prop.name)?;

        let mut devices = Vec::new();
        let mut supply = None;
        for &dev in dt.children(bus) {
            let dev_name = dt
                .node(dev)
                .name()
                .split('@')
                .next()
                .unwrap_or_default()
                .to_owned();
            let addr = dt
                .unit_addr(dev)
                .ok_or_else(|| SpiError::InvalidUnitAddress { node: dt.path(dev) })?
                as usize;
            let cs = cs_pins
                .get(addr)
                .cloned()
                .ok_or_else(|| SpiError::ChipSelectIndex {
                    device: dt.path(dev),
                    index: addr,
                    len: cs_pins.len(),
                })?;

            let drdy = match dt.prop(dev, "int-gpios") {
                Some(_) => Some(first_gpio_entry(dt, dev, "int-gpios")?),
                None => None,
            };
            devices.push(SpiDevice {
                name: dev_name,
                cs,
                drdy,
            });

            // Every device overwrites the bus supply, present or not; the
            // last one declared wins.
            // TODO: ask the hardware team whether the supply rail is really
            // shared per bus; if not, move `supply` onto the device entry.
            supply = match dt.prop(dev, "supply-gpios") {
                Some(_) => Some(first_gpio_entry(dt, dev, "supply-gpios")?),
                None => None,
            };
        }

        busses.push(SpiBus {
            name: bus_name,
            devices,
            supply,
        });
    }

    Ok(SpiDocument {
        versions: vec![SpiVersion {
            name: version,
            busses,
        }],
    })
}

/// Decode a `*-gpios` property into `(port, pin)` entries
///
/// Each entry is a controller phandle followed by as many specifier cells
/// as the controller's `#gpio-cells` declares; the pin is the first
/// specifier cell.
fn gpio_entries(dt: &Devicetree, node: NodeId, property: &str) -> Result<Vec<PinRef>, SpiError> {
    let malformed = || SpiError::MalformedSpecifier {
        node: dt.path(node),
        property: property.to_owned(),
    };
    let cells = dt.cells(node, property).ok_or_else(malformed)?;

    let mut entries = Vec::new();
    let mut at = 0;
    while at < cells.len() {
        let &Cell::Phandle(controller) = &cells[at] else {
            return Err(malformed());
        };
        let specifier_cells =
            dt.u32_prop(controller, "#gpio-cells")
                .ok_or_else(|| SpiError::MissingGpioCells {
                    controller: dt.path(controller),
                })? as usize;
        if specifier_cells == 0 || at + specifier_cells >= cells.len() {
            return Err(malformed());
        }
        let &Cell::Num(pin) = &cells[at + 1] else {
            return Err(malformed());
        };
        let port = dt
            .first_label(controller)
            .ok_or_else(|| SpiError::UnlabeledController {
                controller: dt.path(controller),
            })?
            .replace("gpio", "");
        entries.push(PinRef { port, pin });
        at += 1 + specifier_cells;
    }
    Ok(entries)
}

fn first_gpio_entry(dt: &Devicetree, node: NodeId, property: &str) -> Result<PinRef, SpiError> {
    gpio_entries(dt, node, property)?
        .into_iter()
        .next()
        .ok_or_else(|| SpiError::MalformedSpecifier {
            node: dt.path(node),
            property: property.to_owned(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dts::parse::parse_dts;
    use indoc::indoc;

    const BOARD: &str = indoc! {r#"
        / {
            version = "fmu-v6x";

            gpioa: gpio@48000000 {
                #gpio-cells = <2>;
            };
            gpiob: gpio@48000400 {
                #gpio-cells = <2>;
            };

            spi1: spi@40003800 {
                status = "okay";
                cs-gpios = <&gpioa 4 0>, <&gpiob 10 0>;

                imu@0 {
                    int-gpios = <&gpiob 5 0>;
                };
                mag@1 {
                    supply-gpios = <&gpioa 8 0>;
                };
            };

            spi2: spi@40003c00 {
                status = "disabled";
                cs-gpios = <&gpioa 6 0>;
            };
        };
    "#};

    #[test]
    fn two_device_bus_extracts_unit_address_indexed_chip_selects() {
        let dt = parse_dts(BOARD).unwrap();
        let doc = extract_spi_topology(&dt).unwrap();

        assert_eq!(doc.versions.len(), 1);
        let version = &doc.versions[0];
        assert_eq!(version.name, "fmu-v6x");
        // the disabled bus must not appear
        assert_eq!(version.busses.len(), 1);

        let bus = &version.busses[0];
        assert_eq!(bus.name, "spi1");
        assert_eq!(bus.devices.len(), 2);
        assert_eq!(
            bus.devices[0],
            SpiDevice {
                name: "imu".to_owned(),
                cs: PinRef {
                    port: "a".to_owned(),
                    pin: 4
                },
                drdy: Some(PinRef {
                    port: "b".to_owned(),
                    pin: 5
                }),
            }
        );
        assert_eq!(
            bus.devices[1],
            SpiDevice {
                name: "mag".to_owned(),
                cs: PinRef {
                    port: "b".to_owned(),
                    pin: 10
                },
                drdy: None,
            }
        );
        assert_eq!(
            bus.supply,
            Some(PinRef {
                port: "a".to_owned(),
                pin: 8
            })
        );
    }

    #[test]
    fn last_device_without_supply_clears_the_bus_supply() {
        let dt = parse_dts(indoc! {r#"
            / {
                version = "v1";
                gpioa: gpio@0 {
                    #gpio-cells = <2>;
                };
                spi1: spi@100 {
                    cs-gpios = <&gpioa 1 0>, <&gpioa 2 0>;
                    first@0 {
                        supply-gpios = <&gpioa 9 0>;
                    };
                    second@1 { };
                };
            };
        "#})
        .unwrap();
        let doc = extract_spi_topology(&dt).unwrap();
        assert_eq!(doc.versions[0].busses[0].supply, None);
    }

    #[test]
    fn chip_select_index_out_of_range_fails() {
        let dt = parse_dts(indoc! {r#"
            / {
                version = "v1";
                gpioa: gpio@0 {
                    #gpio-cells = <2>;
                };
                spi1: spi@100 {
                    cs-gpios = <&gpioa 1 0>;
                    imu@4 { };
                };
            };
        "#})
        .unwrap();
        let err = extract_spi_topology(&dt).unwrap_err();
        assert!(matches!(
            err,
            SpiError::ChipSelectIndex { index: 4, len: 1, .. }
        ));
    }

    #[test]
    fn missing_version_fails() {
        let dt = parse_dts("/ { };").unwrap();
        assert!(matches!(
            extract_spi_topology(&dt),
            Err(SpiError::MissingVersion { .. })
        ));
    }

    #[test]
    fn extraction_is_reproducible() {
        let dt = parse_dts(BOARD).unwrap();
        let first = serde_json::to_string_pretty(&extract_spi_topology(&dt).unwrap()).unwrap();
        let again = serde_json::to_string_pretty(&extract_spi_topology(&dt).unwrap()).unwrap();
        assert_eq!(first, again);
    }
}
