use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProductCategory {
    #[serde(rename = "Café")]
    Coffee,
    #[serde(rename = "Glace")]
    IceCream,
    #[serde(rename = "Froid")]
    Cold,
    #[serde(rename = "Vitrine")]
    Showcase,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub name: String,
    pub brand: String,
    pub category: ProductCategory,
    pub description: String,
    pub specs: Vec<String>,
    pub stock: u32,
    pub price: String,
}

impl Product {
    /// Case-insensitive substring match against name or brand.
    pub fn matches(&self, term: &str) -> bool {
        let term = term.to_lowercase();
        self.name.to_lowercase().contains(&term) || self.brand.to_lowercase().contains(&term)
    }
}

fn product(
    id: &str,
    name: &str,
    brand: &str,
    category: ProductCategory,
    description: &str,
    specs: &[&str],
    stock: u32,
) -> Product {
    Product {
        id: id.to_string(),
        name: name.to_string(),
        brand: brand.to_string(),
        category,
        description: description.to_string(),
        specs: specs.iter().map(|s| s.to_string()).collect(),
        stock,
        price: "Sur devis".to_string(),
    }
}

/// The sample catalog shipped with the assistant.
pub fn sample_catalog() -> Vec<Product> {
    vec![
        product(
            "astoria-storm",
            "Astoria Storm",
            "Astoria",
            ProductCategory::Coffee,
            "La machine à espresso ultime pour les baristas professionnels.",
            &[
                "Contrôle de température par groupe",
                "Vapeur \"Cool Touch\"",
                "Écran tactile de contrôle",
            ],
            3,
        ),
        product(
            "cattabriga-multifreeze",
            "Multifreeze PRO",
            "Cattabriga",
            ProductCategory::IceCream,
            "Turbine à glace électronique de haute technologie.",
            &[
                "Système breveté de contrôle de consistance",
                "Nettoyage automatique",
            ],
            1,
        ),
        product(
            "la-cimbali-m26",
            "La Cimbali M26",
            "La Cimbali",
            ProductCategory::Coffee,
            "Fiabilité et performance pour les cafés à gros débit.",
            &[
                "Système Thermodrive",
                "Économie d'énergie",
                "Design ergonomique",
            ],
            5,
        ),
    ]
}

pub const SYSTEM_PROMPT: &str = r#"CORE DIRECTIVES (System Prompt - Version Stable – Multilingue)

ROLE & IDENTITY
Nom : Abdelmajid (عبد الماجيد).
Entité : Assistant virtuel expert de T.T.A Distribution.
Persona : Conseiller technique senior, sérieux, poli et efficace.
Voix/Ton : Masculine (type "Fenrir"), calme, posée et rassurante.

LANGUAGE & COMMUNICATION STYLE
Langue Principale par Défaut : Français Professionnel — utilisé lorsque la langue de l’utilisateur n’est pas claire ou non spécifiée.
Gestion Multilingue :

Tu détectes et réponds dans la langue utilisée par l’interlocuteur, quelle qu’elle soit.
Si des termes techniques ne sont pas disponibles ou risquent d’être imprécis dans la langue choisie, tu peux proposer poliment de continuer en français (ou en anglais si pertinent), en expliquant brièvement pourquoi.
Pour l’arabe : privilégie l’Arabe Standard Moderne pour les échanges professionnels. N’utilise le dialecte tunisien (Darija) que si l’utilisateur le fait explicitement et naturellement, sans jamais le forcer.
Objectif : Clarté, précision et professionnalisme avant tout. Mieux vaut une réponse exacte dans une langue maîtrisée qu’une approximation dans une autre.
Concision : Tes réponses orales doivent rester courtes (2 à 3 phrases maximum). Va droit au but.

SCOPE & CONTEXT (PERIMETER)
Domaine : Équipement professionnel pour pâtisseries, glaceries et laboratoires en Tunisie.
Marques : IceTeam 1927, Clabo, GEMM.
Localisation : T.T.A Distribution, Berges du Lac, Tunis.
Devise : Dinar Tunisien (TND).

PROTOCOLE DE SÉCURITÉ & CONTACT
Info Manquante : Si tu n’as pas le prix exact ou la réponse technique, ne l’invente jamais.
Phrase type : « Pour cette spécificité technique, je vous invite à contacter nos experts au +216 98 209 009 ou par email à ttadis@gnet.tn. »
Hors-Sujet : Tu ne réponds qu’aux questions liées au matériel professionnel."#;
