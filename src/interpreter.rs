use std::io::Write;

use anyhow::{Context, Result};
use tracing::debug;

use crate::cli::{self, Directive};
use crate::devices::{Registry, RelayDevice};

enum Flow {
    Continue,
    Halt,
}

/// Directive-execution state for one invocation: the registry plus the
/// currently selected device.
struct Interpreter<'a, D, W> {
    registry: &'a mut Registry<D>,
    out: W,
    active: Option<usize>,
}

/// Runs one invocation against an already-enumerated registry and
/// returns the process exit code. Only driver and output faults come
/// back as errors; everything user-correctable is reported on `out`.
pub fn dispatch<D: RelayDevice>(
    registry: &mut Registry<D>,
    args: &[String],
    out: &mut impl Write,
) -> Result<u8> {
    if registry.is_empty() {
        writeln!(out, "No device found")?;
        return Ok(1);
    }

    let directives = match cli::parse(args) {
        Ok(directives) => directives,
        Err(err) => {
            write!(out, "{}", err.render())?;
            writeln!(out)?;
            write!(out, "{}", cli::usage())?;
            return Ok(2);
        }
    };

    if directives.is_empty() {
        write!(out, "{}", cli::usage())?;
        writeln!(out)?;
        print_list(registry, out)?;
        return Ok(0);
    }

    // A sole device needs no -D/-d to be addressed.
    let active = if registry.len() == 1 { Some(0) } else { None };
    let mut interpreter = Interpreter {
        registry,
        out,
        active,
    };
    for directive in &directives {
        debug!(?directive, "dispatching");
        if let Flow::Halt = interpreter.step(directive)? {
            break;
        }
    }
    Ok(0)
}

impl<D: RelayDevice, W: Write> Interpreter<'_, D, W> {
    fn step(&mut self, directive: &Directive) -> Result<Flow> {
        match directive {
            Directive::SelectById(id) => {
                self.active = None;
                match self.registry.position_by_id(id) {
                    Some(index) => {
                        self.active = Some(index);
                        Ok(Flow::Continue)
                    }
                    None => {
                        writeln!(self.out, "device with id {id} not found")?;
                        Ok(Flow::Halt)
                    }
                }
            }
            Directive::SelectByIndex(index) => {
                let resolved = usize::try_from(*index)
                    .ok()
                    .filter(|candidate| *candidate < self.registry.len());
                match resolved {
                    Some(candidate) => {
                        self.active = Some(candidate);
                        Ok(Flow::Continue)
                    }
                    None => {
                        writeln!(self.out, "unknown device {index}")?;
                        Ok(Flow::Halt)
                    }
                }
            }
            Directive::SwitchOff(port) => self.switch(*port, false),
            Directive::SwitchOn(port) => self.switch(*port, true),
            Directive::Toggle(port) => self.toggle(*port),
            Directive::GetStatus => match self.active {
                Some(index) => {
                    self.print_status(index)?;
                    Ok(Flow::Continue)
                }
                None => self.report_no_selection(),
            },
            Directive::Help => {
                write!(self.out, "{}", cli::usage())?;
                writeln!(self.out)?;
                Ok(Flow::Continue)
            }
            Directive::ListDevices => {
                print_list(self.registry, &mut self.out)?;
                Ok(Flow::Continue)
            }
            Directive::DetachKernelDriver => {
                let Some(index) = self.active else {
                    return self.report_no_selection();
                };
                let Some(device) = self.registry.get_mut(index) else {
                    return self.report_no_selection();
                };
                device
                    .detach_kernel_driver()
                    .context("failed to detach kernel driver")?;
                Ok(Flow::Continue)
            }
        }
    }

    fn switch(&mut self, port: i32, on: bool) -> Result<Flow> {
        let Some(index) = self.active else {
            return self.report_no_selection();
        };
        let Some(port) = self.checkport(index, port)? else {
            return Ok(Flow::Halt);
        };
        let Some(device) = self.registry.get_mut(index) else {
            return self.report_no_selection();
        };
        if on {
            device
                .switch_on(port)
                .with_context(|| format!("failed to switch port {port} on"))?;
        } else {
            device
                .switch_off(port)
                .with_context(|| format!("failed to switch port {port} off"))?;
        }
        self.print_status(index)?;
        Ok(Flow::Continue)
    }

    // Toggle reads the port first; the driver is the source of truth, no
    // state is cached between directives.
    fn toggle(&mut self, port: i32) -> Result<Flow> {
        let Some(index) = self.active else {
            return self.report_no_selection();
        };
        let Some(port) = self.checkport(index, port)? else {
            return Ok(Flow::Halt);
        };
        let Some(device) = self.registry.get_mut(index) else {
            return self.report_no_selection();
        };
        let current = device
            .status(port)
            .with_context(|| format!("failed to read port {port}"))?;
        if current == 0 {
            device
                .switch_on(port)
                .with_context(|| format!("failed to switch port {port} on"))?;
        } else {
            device
                .switch_off(port)
                .with_context(|| format!("failed to switch port {port} off"))?;
        }
        self.print_status(index)?;
        Ok(Flow::Continue)
    }

    /// Validates a requested port against the device range, reporting the
    /// range on a miss. Runs before any driver call.
    fn checkport(&mut self, index: usize, port: i32) -> Result<Option<u8>> {
        let Some(device) = self.registry.get(index) else {
            return Ok(None);
        };
        let min = device.min_port();
        let max = device.max_port();
        if (i32::from(min)..=i32::from(max)).contains(&port) {
            return Ok(Some(port as u8));
        }
        writeln!(
            self.out,
            "Device {} only has ports {}..{}",
            device.id(),
            min,
            max
        )?;
        Ok(None)
    }

    fn print_status(&mut self, index: usize) -> Result<()> {
        let Some(device) = self.registry.get(index) else {
            return Ok(());
        };
        writeln!(self.out, "id {}", device.id())?;
        for port in device.min_port()..=device.max_port() {
            let value = device
                .status(port)
                .with_context(|| format!("failed to read port {port}"))?;
            writeln!(self.out, "\tstatus[{port}] = {value}")?;
        }
        Ok(())
    }

    fn report_no_selection(&mut self) -> Result<Flow> {
        writeln!(self.out, "no device selected (use -D or -d)")?;
        Ok(Flow::Halt)
    }
}

fn print_list<D: RelayDevice>(registry: &Registry<D>, out: &mut impl Write) -> Result<()> {
    writeln!(out, "Available devices")?;
    for (index, device) in registry.iter().enumerate() {
        writeln!(out, "device {index}, id {}", device.id())?;
    }
    Ok(())
}
