use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::error::ErrorCategory;
use crate::generic_types::{ToolCall, ToolDeclaration, ToolResult};
use crate::imagegen::{ImageGenerator, poster_prompt};
use crate::store::{AssistantStore, LeadPriority, LogKind, NewLead, TaskPriority};

pub const CHECK_INVENTORY: &str = "checkInventory";
pub const GENERATE_MARKETING_POSTER: &str = "generateMarketingPoster";
pub const SEND_SALES_LEAD_REPORT: &str = "sendSalesLeadReport";
pub const MANAGE_TODO_LIST: &str = "manageTodoList";

const DEFAULT_RESULT: &str = "OK.";
const DEGRADED_RESULT: &str = "Désolé, cette action n'a pas pu être exécutée.";

/// The four functions declared to the live model at setup.
pub fn declarations() -> Vec<ToolDeclaration> {
    vec![
        ToolDeclaration {
            name: CHECK_INVENTORY.to_string(),
            description: "Vérifie la disponibilité en stock d'une machine dans la base T.T.A."
                .to_string(),
            parameters: json!({
                "type": "OBJECT",
                "properties": {
                    "productName": { "type": "STRING", "description": "Le nom de la machine ou la marque." }
                },
                "required": ["productName"]
            }),
        },
        ToolDeclaration {
            name: SEND_SALES_LEAD_REPORT.to_string(),
            description: "Enregistre un nouveau prospect (lead) dans le registre commercial."
                .to_string(),
            parameters: json!({
                "type": "OBJECT",
                "properties": {
                    "customerName": { "type": "STRING" },
                    "customerPhone": { "type": "STRING", "description": "Le numéro de téléphone du client." },
                    "interestedProducts": { "type": "STRING" },
                    "summary": { "type": "STRING" },
                    "urgency": { "type": "STRING", "enum": ["normal", "urgent"] }
                },
                "required": ["customerName", "interestedProducts", "summary"]
            }),
        },
        ToolDeclaration {
            name: MANAGE_TODO_LIST.to_string(),
            description: "Ajoute ou modifie des tâches dans la liste administrative.".to_string(),
            parameters: json!({
                "type": "OBJECT",
                "properties": {
                    "action": { "type": "STRING", "enum": ["add", "list", "complete", "delete"] },
                    "taskText": { "type": "STRING" },
                    "taskId": { "type": "STRING" }
                },
                "required": ["action"]
            }),
        },
        ToolDeclaration {
            name: GENERATE_MARKETING_POSTER.to_string(),
            description: "Génère un visuel publicitaire haute qualité pour une machine."
                .to_string(),
            parameters: json!({
                "type": "OBJECT",
                "properties": {
                    "prompt": { "type": "STRING", "description": "Le sujet du poster marketing." }
                },
                "required": ["prompt"]
            }),
        },
    ]
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid arguments for {tool}: {source}")]
    InvalidArguments {
        tool: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("missing argument `{arg}` for {tool}")]
    MissingArgument { tool: String, arg: &'static str },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InventoryArgs {
    product_name: String,
}

#[derive(Debug, Deserialize)]
struct PosterArgs {
    prompt: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeadArgs {
    customer_name: String,
    customer_phone: Option<String>,
    interested_products: String,
    summary: String,
    urgency: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum TodoAction {
    Add,
    List,
    Complete,
    Delete,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TodoArgs {
    action: TodoAction,
    task_text: Option<String>,
    task_id: Option<String>,
}

fn parse_args<T: for<'de> Deserialize<'de>>(call: &ToolCall) -> Result<T, ToolError> {
    serde_json::from_value(call.args.clone()).map_err(|source| ToolError::InvalidArguments {
        tool: call.name.clone(),
        source,
    })
}

/// Executes tool calls against the store. Every call gets exactly one answer.
pub struct ToolDispatcher {
    store: Arc<dyn AssistantStore>,
    images: Arc<dyn ImageGenerator>,
}

impl ToolDispatcher {
    pub fn new(store: Arc<dyn AssistantStore>, images: Arc<dyn ImageGenerator>) -> Self {
        Self { store, images }
    }

    /// Runs one call and always produces its result, degrading failures to a
    /// short apology the model can relay.
    pub async fn dispatch(&self, call: &ToolCall) -> ToolResult {
        tracing::debug!("dispatching tool call {} ({})", call.name, call.id);
        let text = match self.execute(call).await {
            Ok(text) => text,
            Err(ToolError::UnknownTool(name)) => {
                tracing::warn!("model called an undeclared tool: {}", name);
                format!("Fonction {name} non prise en charge.")
            }
            Err(err) => {
                tracing::warn!("tool {} failed: {}", call.name, err);
                self.store.log_error(
                    ErrorCategory::ToolExecutionFailure,
                    &format!("Outil {} : échec d'exécution.", call.name),
                );
                DEGRADED_RESULT.to_string()
            }
        };
        ToolResult::for_call(call, text)
    }

    async fn execute(&self, call: &ToolCall) -> Result<String, ToolError> {
        match call.name.as_str() {
            CHECK_INVENTORY => self.check_inventory(parse_args(call)?),
            GENERATE_MARKETING_POSTER => Ok(self.generate_poster(parse_args(call)?).await),
            SEND_SALES_LEAD_REPORT => Ok(self.send_lead(parse_args(call)?)),
            MANAGE_TODO_LIST => self.manage_todos(parse_args(call)?),
            other => Err(ToolError::UnknownTool(other.to_string())),
        }
    }

    fn check_inventory(&self, args: InventoryArgs) -> Result<String, ToolError> {
        let found = self
            .store
            .catalog()
            .into_iter()
            .find(|p| p.matches(&args.product_name));
        self.store.log_info(&format!(
            "Outil Inventaire : Consultation pour {}",
            args.product_name
        ));
        Ok(match found {
            Some(p) => format!(
                "Le stock pour {} est de {} unités au prix de {}.",
                p.name, p.stock, p.price
            ),
            None => "Produit non trouvé en base T.T.A.".to_string(),
        })
    }

    async fn generate_poster(&self, args: PosterArgs) -> String {
        self.store.increment_requests();
        match self.images.generate(&poster_prompt(&args.prompt)).await {
            Ok(Some(image)) => {
                self.store.add_generated_image(image.data_url(), &args.prompt);
                self.store.add_log(
                    LogKind::Ai,
                    None,
                    &format!("Studio : Poster généré avec succès pour \"{}\"", args.prompt),
                );
                "Poster marketing généré dans le studio.".to_string()
            }
            Ok(None) => {
                tracing::warn!("image model returned no image for {:?}", args.prompt);
                self.poster_failed()
            }
            Err(err) => {
                tracing::error!("image generation failed: {:#}", err);
                self.poster_failed()
            }
        }
    }

    fn poster_failed(&self) -> String {
        self.store.log_error(
            ErrorCategory::ToolExecutionFailure,
            "Échec de génération d'image marketing via AI.",
        );
        "Echec technique de la génération.".to_string()
    }

    fn send_lead(&self, args: LeadArgs) -> String {
        let priority = match args.urgency.as_deref() {
            Some("urgent") => LeadPriority::Urgent,
            _ => LeadPriority::Normal,
        };
        let lead = self.store.add_lead(NewLead {
            customer_name: args.customer_name,
            customer_phone: args.customer_phone,
            interested_products: args.interested_products,
            summary: args.summary,
            priority,
        });
        self.store.trigger_report_toast();
        self.store.add_log(
            LogKind::Ai,
            None,
            &format!("Outil Ventes : Lead capturé ({})", lead.customer_name),
        );
        DEFAULT_RESULT.to_string()
    }

    fn manage_todos(&self, args: TodoArgs) -> Result<String, ToolError> {
        let result = match args.action {
            TodoAction::Add => {
                let text = args.task_text.ok_or_else(|| ToolError::MissingArgument {
                    tool: MANAGE_TODO_LIST.to_string(),
                    arg: "taskText",
                })?;
                self.store.add_todo(&text, TaskPriority::Medium);
                "Action ajoutée à la liste du manager.".to_string()
            }
            TodoAction::List => {
                let pending = self.store.todos().iter().filter(|t| !t.completed).count();
                format!("Vous avez {pending} tâches en attente.")
            }
            TodoAction::Complete => {
                // unmatched fragments still report success
                if let Some(id) = self.find_task(&args.task_text, &args.task_id) {
                    self.store.toggle_todo(&id);
                }
                "Tâche mise à jour.".to_string()
            }
            TodoAction::Delete => {
                if let Some(id) = self.find_task(&args.task_text, &args.task_id) {
                    self.store.delete_todo(&id);
                }
                "Tâche supprimée.".to_string()
            }
        };
        self.store
            .log_info("Outil Tâche : Modification du registre des actions.");
        Ok(result)
    }

    fn find_task(&self, text: &Option<String>, id: &Option<String>) -> Option<String> {
        self.store
            .todos()
            .into_iter()
            .find(|t| {
                text.as_deref().is_some_and(|frag| t.text.contains(frag))
                    || id.as_deref() == Some(t.id.as_str())
            })
            .map(|t| t.id)
    }
}
